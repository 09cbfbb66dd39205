//! Mock transport for testing.
//!
//! Records every call, keeps the sinks of open subscriptions so tests can
//! push relay messages into them, and serves canned query results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    RelayTransport, SubscriptionEnvelope, SubscriptionHandle, SubscriptionMessage,
    SubscriptionRequest, SubscriptionSink, TransportError,
};
use crate::nostr::nip11::RelayDescriptor;

#[derive(Debug, Clone)]
pub enum MockCall {
    Subscribe {
        handle: SubscriptionHandle,
        relay: String,
        generation: u64,
        filter: Filter,
    },
    Close {
        handle: SubscriptionHandle,
    },
    Publish {
        relay: String,
        event: Event,
    },
    Fetch {
        relays: Vec<String>,
    },
}

struct OpenSubscription {
    generation: u64,
    sink: SubscriptionSink,
}

#[derive(Default)]
struct MockTransportInner {
    next_handle: u64,
    calls: Vec<MockCall>,
    open: HashMap<u64, OpenSubscription>,
    rejecting: HashMap<String, String>,
    stalled: HashSet<String>,
    stored: Vec<(String, Event)>,
    descriptors: HashMap<String, RelayDescriptor>,
    held_publishes: HashMap<String, watch::Sender<bool>>,
    held_descriptors: HashMap<String, watch::Sender<bool>>,
}

fn gate(held: &HashMap<String, watch::Sender<bool>>, relay: &str) -> Option<watch::Receiver<bool>> {
    held.get(relay).map(|tx| tx.subscribe())
}

fn open_gate(held: &mut HashMap<String, watch::Sender<bool>>, relay: &str) {
    if let Some(tx) = held.remove(relay) {
        tx.send_replace(true);
    }
}

async fn pass(gate: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = gate {
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a message into an open subscription, tagged with its generation.
    /// Returns false if the handle is not open.
    pub fn emit(&self, handle: SubscriptionHandle, message: SubscriptionMessage) -> bool {
        let inner = self.inner.lock();
        match inner.open.get(&handle.0) {
            Some(sub) => sub
                .sink
                .send(SubscriptionEnvelope {
                    generation: sub.generation,
                    message,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Push a message into the most recently opened subscription.
    pub fn emit_latest(&self, message: SubscriptionMessage) -> bool {
        match self.latest_subscription() {
            Some(handle) => self.emit(handle, message),
            None => false,
        }
    }

    /// Deliver a message with an arbitrary generation on the sink of `handle`,
    /// simulating a late delivery from an already superseded subscription.
    pub fn emit_stale(
        &self,
        handle: SubscriptionHandle,
        generation: u64,
        message: SubscriptionMessage,
    ) -> bool {
        let inner = self.inner.lock();
        match inner.open.get(&handle.0) {
            Some(sub) => sub
                .sink
                .send(SubscriptionEnvelope {
                    generation,
                    message,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Make every publish to `relay` fail with `reason`.
    pub fn reject_relay(&self, relay: &str, reason: &str) {
        self.inner
            .lock()
            .rejecting
            .insert(relay.to_string(), reason.to_string());
    }

    /// Make every publish to `relay` hang forever.
    pub fn stall_relay(&self, relay: &str) {
        self.inner.lock().stalled.insert(relay.to_string());
    }

    /// Park publishes to `relay` until [`release_relay`](Self::release_relay).
    pub fn hold_relay(&self, relay: &str) {
        self.inner
            .lock()
            .held_publishes
            .insert(relay.to_string(), watch::channel(false).0);
    }

    pub fn release_relay(&self, relay: &str) {
        open_gate(&mut self.inner.lock().held_publishes, relay);
    }

    /// Park descriptor lookups of `relay` until
    /// [`release_descriptor`](Self::release_descriptor).
    pub fn hold_descriptor(&self, relay: &str) {
        self.inner
            .lock()
            .held_descriptors
            .insert(relay.to_string(), watch::channel(false).0);
    }

    pub fn release_descriptor(&self, relay: &str) {
        open_gate(&mut self.inner.lock().held_descriptors, relay);
    }

    /// Store an event as held by `relay` for `fetch_latest`.
    pub fn store_event(&self, relay: &str, event: Event) {
        self.inner.lock().stored.push((relay.to_string(), event));
    }

    pub fn set_descriptor(&self, relay: &str, descriptor: RelayDescriptor) {
        self.inner
            .lock()
            .descriptors
            .insert(relay.to_string(), descriptor);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().calls.clone()
    }

    /// Successfully published (relay, event) pairs, in call order.
    pub fn published(&self) -> Vec<(String, Event)> {
        let inner = self.inner.lock();
        inner
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Publish { relay, event } if !inner.rejecting.contains_key(relay) => {
                    Some((relay.clone(), event.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn latest_subscription(&self) -> Option<SubscriptionHandle> {
        self.inner
            .lock()
            .calls
            .iter()
            .rev()
            .find_map(|c| match c {
                MockCall::Subscribe { handle, .. } => Some(*handle),
                _ => None,
            })
    }
}

fn matches(filter: &Filter, event: &Event) -> bool {
    let kind_ok = filter
        .kinds
        .as_ref()
        .map(|kinds| kinds.contains(&event.kind))
        .unwrap_or(true);
    let author_ok = filter
        .authors
        .as_ref()
        .map(|authors| authors.contains(&event.pubkey))
        .unwrap_or(true);
    kind_ok && author_ok
}

#[async_trait]
impl RelayTransport for MockTransport {
    fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: SubscriptionSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        inner.open.insert(
            handle.0,
            OpenSubscription {
                generation: request.generation,
                sink,
            },
        );
        inner.calls.push(MockCall::Subscribe {
            handle,
            relay: request.relay,
            generation: request.generation,
            filter: request.filter,
        });
        Ok(handle)
    }

    fn close(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock();
        inner.open.remove(&handle.0);
        inner.calls.push(MockCall::Close { handle });
    }

    async fn publish(&self, relay: &str, event: &Event) -> Result<(), TransportError> {
        let (stalled, held) = {
            let mut inner = self.inner.lock();
            inner.calls.push(MockCall::Publish {
                relay: relay.to_string(),
                event: event.clone(),
            });
            (
                inner.stalled.contains(relay),
                gate(&inner.held_publishes, relay),
            )
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        pass(held).await;
        // Read after the gate so a test can decide the outcome while parked.
        let rejection = self.inner.lock().rejecting.get(relay).cloned();
        match rejection {
            Some(reason) => Err(TransportError::Rejected {
                relay: relay.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn fetch_latest(
        &self,
        relays: &[String],
        filter: Filter,
        _timeout: Duration,
    ) -> Result<Option<Event>, TransportError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Fetch {
            relays: relays.to_vec(),
        });
        Ok(inner
            .stored
            .iter()
            .filter(|(relay, event)| relays.contains(relay) && matches(&filter, event))
            .map(|(_, event)| event.clone())
            .max_by_key(|e| e.created_at))
    }

    async fn fetch_descriptor(&self, relay: &str, _timeout: Duration) -> Option<RelayDescriptor> {
        let held = gate(&self.inner.lock().held_descriptors, relay);
        pass(held).await;
        self.inner.lock().descriptors.get(relay).cloned()
    }
}
