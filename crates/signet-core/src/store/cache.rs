use std::collections::HashMap;

use nostr_sdk::prelude::*;

use crate::models::metadata::ProfileMetadata;
use crate::models::relay::RelaySpec;

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Written optimistically after one of our own publishes succeeded
    Local,
    /// Observed on the network
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub created_at: Timestamp,
    pub origin: Origin,
}

/// Last-write-wins by record timestamp. Equal timestamps keep what is cached.
fn reconcile<T>(
    slots: &mut HashMap<PublicKey, Versioned<T>>,
    pubkey: PublicKey,
    incoming: Versioned<T>,
) -> bool {
    match slots.get(&pubkey) {
        Some(current) if current.created_at >= incoming.created_at => {
            tracing::debug!(
                pubkey = %pubkey,
                cached = current.created_at.as_u64(),
                incoming = incoming.created_at.as_u64(),
                "ignoring older or equal version"
            );
            false
        }
        _ => {
            slots.insert(pubkey, incoming);
            true
        }
    }
}

/// Per-identity cache of the records this engine publishes: profile metadata
/// and relay lists.
#[derive(Debug, Default)]
pub struct LocalCache {
    profiles: HashMap<PublicKey, Versioned<ProfileMetadata>>,
    relay_lists: HashMap<PublicKey, Versioned<Vec<RelaySpec>>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a profile version. Returns true if it replaced the cached one.
    pub fn put_profile(
        &mut self,
        pubkey: PublicKey,
        value: ProfileMetadata,
        created_at: Timestamp,
        origin: Origin,
    ) -> bool {
        reconcile(
            &mut self.profiles,
            pubkey,
            Versioned {
                value,
                created_at,
                origin,
            },
        )
    }

    pub fn profile(&self, pubkey: &PublicKey) -> Option<&Versioned<ProfileMetadata>> {
        self.profiles.get(pubkey)
    }

    /// Offer a relay-list version. Returns true if it replaced the cached one.
    pub fn put_relay_list(
        &mut self,
        pubkey: PublicKey,
        value: Vec<RelaySpec>,
        created_at: Timestamp,
        origin: Origin,
    ) -> bool {
        reconcile(
            &mut self.relay_lists,
            pubkey,
            Versioned {
                value,
                created_at,
                origin,
            },
        )
    }

    pub fn relay_list(&self, pubkey: &PublicKey) -> Option<&Versioned<Vec<RelaySpec>>> {
        self.relay_lists.get(pubkey)
    }

    /// Drop everything cached for one identity.
    pub fn forget(&mut self, pubkey: &PublicKey) {
        self.profiles.remove(pubkey);
        self.relay_lists.remove(pubkey);
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
        self.relay_lists.clear();
    }
}
