//! The single live bunker-config subscription.
//!
//! `SubscriptionManager` derives its subscription from the credential tuple
//! (coordination endpoint, public key, secret key). Every change closes the
//! current subscription before anything else happens and bumps a generation
//! counter; messages carrying an older generation are dropped on arrival, so
//! nothing from a previous identity can reach the state of the next one.

use std::sync::Arc;

use nostr_sdk::prelude::*;

use crate::constants::kinds;
use crate::credentials::Credentials;
use crate::nostr::transport::{
    RelayTransport, SubscriptionEnvelope, SubscriptionHandle, SubscriptionMessage,
    SubscriptionRequest, SubscriptionSink, TransportError,
};
use crate::store::{BunkerState, RecordOutcome};

#[derive(Debug, Clone)]
struct ActiveSubscription {
    handle: SubscriptionHandle,
    coordinator: String,
    public_key: PublicKey,
}

/// What a handled message changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionUpdate {
    /// `state.profiles` or `state.status` changed.
    Profiles,
    /// The subscription ended on the relay side.
    Closed(String),
}

pub struct SubscriptionManager {
    transport: Arc<dyn RelayTransport>,
    sink: SubscriptionSink,
    generation: u64,
    active: Option<ActiveSubscription>,
    /// Credentials the current subscription (or lack of one) was derived from
    applied: Option<Credentials>,
    pub state: BunkerState,
}

pub fn bunker_filter(public_key: PublicKey) -> Filter {
    Filter::new()
        .author(public_key)
        .kind(Kind::from(kinds::BUNKER_CONFIG))
        .limit(1)
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn RelayTransport>, sink: SubscriptionSink) -> Self {
        Self {
            transport,
            sink,
            generation: 0,
            active: None,
            applied: None,
            state: BunkerState::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Coordination endpoint of the live subscription.
    pub fn coordinator(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.coordinator.as_str())
    }

    /// Rebuild the subscription for `credentials`. Returns `Ok(false)` when
    /// they equal the ones already applied.
    pub fn apply(&mut self, credentials: &Credentials) -> Result<bool, TransportError> {
        if self.applied.as_ref() == Some(credentials) {
            return Ok(false);
        }
        self.applied = Some(credentials.clone());

        self.close_active();
        self.generation += 1;

        let (coordinator, keys) = match (&credentials.coordinator, credentials.keys()) {
            (Some(coordinator), Some(keys)) => (coordinator.clone(), keys),
            _ => {
                tracing::debug!(generation = self.generation, "credentials incomplete, not subscribing");
                self.state.clear();
                return Ok(true);
            }
        };

        let public_key = keys.public_key();
        let request = SubscriptionRequest {
            relay: coordinator.clone(),
            filter: bunker_filter(public_key),
            auth: keys,
            generation: self.generation,
        };

        self.state.begin_loading();
        match self.transport.subscribe(request, self.sink.clone()) {
            Ok(handle) => {
                tracing::info!(
                    relay = %coordinator,
                    pubkey = %public_key,
                    generation = self.generation,
                    "subscribed to bunker config"
                );
                self.active = Some(ActiveSubscription {
                    handle,
                    coordinator,
                    public_key,
                });
                Ok(true)
            }
            Err(e) => {
                tracing::error!(relay = %coordinator, error = %e, "failed to subscribe to bunker config");
                self.state.clear();
                Err(e)
            }
        }
    }

    /// Handle one delivery from the transport. Deliveries from an older
    /// generation, or arriving after teardown, are discarded.
    pub fn handle(&mut self, envelope: SubscriptionEnvelope) -> Option<SubscriptionUpdate> {
        if envelope.generation != self.generation {
            tracing::debug!(
                stale = envelope.generation,
                current = self.generation,
                "discarding message from previous subscription"
            );
            return None;
        }
        let active = self.active.clone()?;

        match envelope.message {
            SubscriptionMessage::Event(event) => {
                if event.pubkey != active.public_key
                    || event.kind != Kind::from(kinds::BUNKER_CONFIG)
                {
                    tracing::warn!(event_id = %event.id, "ignoring event outside the subscription filter");
                    return None;
                }
                match self.state.apply_record(&event, &active.coordinator) {
                    RecordOutcome::Stale => None,
                    RecordOutcome::Applied | RecordOutcome::Invalid => {
                        Some(SubscriptionUpdate::Profiles)
                    }
                }
            }
            SubscriptionMessage::EndOfStoredEvents => self
                .state
                .end_of_stored_events()
                .then_some(SubscriptionUpdate::Profiles),
            SubscriptionMessage::Closed(reason) => {
                tracing::warn!(relay = %active.coordinator, %reason, "bunker config subscription closed");
                self.transport.close(active.handle);
                self.active = None;
                Some(SubscriptionUpdate::Closed(reason))
            }
        }
    }

    /// Optimistically ingest a bunker-config record this session just published.
    pub fn ingest_local(&mut self, event: &Event) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        if event.pubkey != active.public_key {
            return false;
        }
        let coordinator = active.coordinator.clone();
        self.state.apply_record(event, &coordinator) == RecordOutcome::Applied
    }

    /// Close the subscription and forget derived state.
    pub fn teardown(&mut self) {
        self.close_active();
        self.generation += 1;
        self.applied = None;
        self.state.clear();
    }

    fn close_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(relay = %active.coordinator, "closing bunker config subscription");
            self.transport.close(active.handle);
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::transport::{MockCall, MockTransport};
    use crate::store::BunkerStatus;
    use tokio::sync::mpsc;

    const COORD: &str = "wss://promenade.fiatjaf.com";

    fn creds(keys: &Keys, coordinator: &str) -> Credentials {
        Credentials {
            coordinator: Some(coordinator.to_string()),
            public_key: Some(keys.public_key()),
            secret_key: Some(keys.secret_key().clone()),
        }
    }

    fn config_event(keys: &Keys, tags: &[&[&str]]) -> Event {
        EventBuilder::new(Kind::from(kinds::BUNKER_CONFIG), "")
            .tags(tags.iter().map(|t| Tag::parse(t.iter().copied()).unwrap()))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn setup() -> (
        MockTransport,
        SubscriptionManager,
        mpsc::UnboundedReceiver<SubscriptionEnvelope>,
    ) {
        let mock = MockTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SubscriptionManager::new(Arc::new(mock.clone()), tx);
        (mock, manager, rx)
    }

    fn pump(
        manager: &mut SubscriptionManager,
        rx: &mut mpsc::UnboundedReceiver<SubscriptionEnvelope>,
    ) -> Vec<SubscriptionUpdate> {
        let mut updates = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            updates.extend(manager.handle(envelope));
        }
        updates
    }

    #[test]
    fn test_subscribes_with_expected_filter() {
        let (mock, mut manager, _rx) = setup();
        let keys = Keys::generate();
        assert!(manager.apply(&creds(&keys, COORD)).unwrap());

        match &mock.calls()[0] {
            MockCall::Subscribe { relay, filter, generation, .. } => {
                assert_eq!(relay, COORD);
                assert_eq!(filter, &bunker_filter(keys.public_key()));
                assert_eq!(*generation, 1);
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert!(manager.state.is_loading());
        assert!(manager.state.profiles.is_none());
    }

    #[test]
    fn test_change_closes_previous_before_opening_next() {
        let (mock, mut manager, _rx) = setup();
        let alice = Keys::generate();
        let bob = Keys::generate();

        manager.apply(&creds(&alice, COORD)).unwrap();
        manager.apply(&creds(&bob, COORD)).unwrap();
        manager.apply(&creds(&bob, "wss://frostbunker.njump.me")).unwrap();

        let calls = mock.calls();
        let kinds: Vec<&str> = calls
            .iter()
            .map(|c| match c {
                MockCall::Subscribe { .. } => "sub",
                MockCall::Close { .. } => "close",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["sub", "close", "sub", "close", "sub"]);
        assert_eq!(mock.open_subscriptions(), 1);
    }

    #[test]
    fn test_unchanged_credentials_do_not_resubscribe() {
        let (mock, mut manager, _rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();
        assert!(!manager.apply(&creds(&keys, COORD)).unwrap());
        assert_eq!(mock.calls().len(), 1);
    }

    #[test]
    fn test_incomplete_credentials_clear_state_and_stay_closed() {
        let (mock, mut manager, mut rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();
        mock.emit_latest(SubscriptionMessage::EndOfStoredEvents);
        pump(&mut manager, &mut rx);
        assert_eq!(manager.state.profiles, Some(vec![]));

        let mut logged_out = creds(&keys, COORD);
        logged_out.secret_key = None;
        manager.apply(&logged_out).unwrap();

        assert!(!manager.is_active());
        assert_eq!(mock.open_subscriptions(), 0);
        assert_eq!(manager.state.status, BunkerStatus::Idle);
        assert!(manager.state.profiles.is_none());
    }

    #[test]
    fn test_record_then_eose_loads_profiles() {
        let (mock, mut manager, mut rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();

        let event = config_event(
            &keys,
            &[&["h", "abc"], &["profile", "work", "sec1", "{}"], &["profile", "home", "sec2", ""]],
        );
        mock.emit_latest(SubscriptionMessage::Event(Box::new(event)));
        mock.emit_latest(SubscriptionMessage::EndOfStoredEvents);

        let updates = pump(&mut manager, &mut rx);
        assert_eq!(updates, vec![SubscriptionUpdate::Profiles]);
        let profiles = manager.state.profiles.as_ref().unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].name, "work");
        assert!(profiles[1].restrictions.is_none());
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let (mock, mut manager, mut rx) = setup();
        let alice = Keys::generate();
        let bob = Keys::generate();

        manager.apply(&creds(&alice, COORD)).unwrap();
        manager.apply(&creds(&bob, COORD)).unwrap();
        let bob_handle = mock.latest_subscription().unwrap();

        // A late delivery for alice's subscription arrives on the shared sink.
        let alice_event = config_event(&alice, &[&["h", "abc"], &["profile", "alice", "s", ""]]);
        mock.emit_stale(bob_handle, 1, SubscriptionMessage::Event(Box::new(alice_event)));

        assert!(pump(&mut manager, &mut rx).is_empty());
        assert!(manager.state.profiles.is_none());
    }

    #[test]
    fn test_invalid_record_resets_to_empty() {
        let (mock, mut manager, mut rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();

        mock.emit_latest(SubscriptionMessage::Event(Box::new(config_event(
            &keys,
            &[&["profile", "work", "sec1", ""]],
        ))));
        assert_eq!(pump(&mut manager, &mut rx), vec![SubscriptionUpdate::Profiles]);
        assert_eq!(manager.state.profiles, Some(vec![]));
        assert_eq!(manager.state.status, BunkerStatus::Invalid);
    }

    #[test]
    fn test_closed_by_relay_surfaces_error() {
        let (mock, mut manager, mut rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();
        mock.emit_latest(SubscriptionMessage::Closed("restricted".to_string()));

        assert_eq!(
            pump(&mut manager, &mut rx),
            vec![SubscriptionUpdate::Closed("restricted".to_string())]
        );
        assert!(!manager.is_active());
        assert_eq!(mock.open_subscriptions(), 0);
    }

    #[test]
    fn test_teardown_closes_and_discards_late_messages() {
        let (mock, mut manager, mut rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();
        let handle = mock.latest_subscription().unwrap();
        let generation = manager.generation();

        manager.teardown();
        assert_eq!(mock.open_subscriptions(), 0);

        // Even if the transport still had something buffered for the old generation.
        let _ = manager.sink.send(SubscriptionEnvelope {
            generation,
            message: SubscriptionMessage::EndOfStoredEvents,
        });
        assert!(pump(&mut manager, &mut rx).is_empty());
        assert!(!mock.emit(handle, SubscriptionMessage::EndOfStoredEvents));
    }

    #[test]
    fn test_ingest_local_requires_matching_identity() {
        let (_mock, mut manager, _rx) = setup();
        let keys = Keys::generate();
        manager.apply(&creds(&keys, COORD)).unwrap();

        let foreign = config_event(&Keys::generate(), &[&["h", "x"], &["profile", "p", "s", ""]]);
        assert!(!manager.ingest_local(&foreign));

        let own = config_event(&keys, &[&["h", "x"], &["profile", "p", "s", ""]]);
        assert!(manager.ingest_local(&own));
        assert_eq!(manager.state.profiles.as_ref().unwrap()[0].name, "p");
    }
}
