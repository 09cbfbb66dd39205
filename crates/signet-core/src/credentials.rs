//! The active identity and selected coordination endpoint.
//!
//! `CredentialContext` is owned by the control loop. Every mutation that
//! actually changes the tuple bumps a generation counter and is published on a
//! watch channel, so other parts of the process can observe it.

use std::fmt;

use nostr_sdk::prelude::*;
use tokio::sync::watch;

use crate::error::{CoreError, Result};
use crate::nostr::url::normalize_url;

/// Snapshot of the credential tuple.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Normalized coordination endpoint
    pub coordinator: Option<String>,
    pub public_key: Option<PublicKey>,
    pub secret_key: Option<SecretKey>,
}

impl Credentials {
    /// Signing keys, available only when both halves of the identity are
    /// present and belong together.
    pub fn keys(&self) -> Option<Keys> {
        let secret = self.secret_key.clone()?;
        let keys = Keys::new(secret);
        (Some(keys.public_key()) == self.public_key).then_some(keys)
    }

    pub fn is_complete(&self) -> bool {
        self.coordinator.is_some() && self.keys().is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("coordinator", &self.coordinator)
            .field("public_key", &self.public_key.map(|pk| pk.to_hex()))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub struct CredentialContext {
    current: Credentials,
    /// Bumped whenever the identity (either key half) changes
    identity_generation: u64,
    tx: watch::Sender<Credentials>,
}

impl Default for CredentialContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialContext {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Credentials::default());
        Self {
            current: Credentials::default(),
            identity_generation: 0,
            tx,
        }
    }

    pub fn current(&self) -> &Credentials {
        &self.current
    }

    pub fn identity_generation(&self) -> u64 {
        self.identity_generation
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.current.public_key
    }

    pub fn keys(&self) -> Option<Keys> {
        self.current.keys()
    }

    pub fn coordinator(&self) -> Option<&str> {
        self.current.coordinator.as_deref()
    }

    pub fn observe(&self) -> watch::Receiver<Credentials> {
        self.tx.subscribe()
    }

    /// Start a session. Returns whether the tuple changed.
    pub fn login(&mut self, keys: &Keys) -> bool {
        let next = Credentials {
            coordinator: self.current.coordinator.clone(),
            public_key: Some(keys.public_key()),
            secret_key: Some(keys.secret_key().clone()),
        };
        self.replace(next)
    }

    /// End the session, clearing both key halves.
    pub fn logout(&mut self) -> bool {
        let next = Credentials {
            coordinator: self.current.coordinator.clone(),
            public_key: None,
            secret_key: None,
        };
        self.replace(next)
    }

    /// Select a coordination endpoint. The URL is normalized first; an empty
    /// string clears the selection.
    pub fn set_coordinator(&mut self, url: &str) -> Result<bool> {
        let coordinator = if url.trim().is_empty() {
            None
        } else {
            Some(normalize_url(url).map_err(CoreError::from)?)
        };
        let next = Credentials {
            coordinator,
            ..self.current.clone()
        };
        Ok(self.replace(next))
    }

    fn replace(&mut self, next: Credentials) -> bool {
        if next == self.current {
            return false;
        }
        if next.public_key != self.current.public_key || next.secret_key != self.current.secret_key
        {
            self.identity_generation += 1;
        }
        tracing::debug!(credentials = ?next, "credentials changed");
        self.current = next;
        self.tx.send_replace(self.current.clone());
        true
    }
}
