//! Relay transport abstraction.
//!
//! Relays are opaque publish/subscribe endpoints. Everything above this module
//! (subscription management, broadcasting, relay-list loading) talks to them
//! only through [`RelayTransport`], so the same logic runs against live relays
//! ([`NostrSdkTransport`]) and against [`MockTransport`] in tests.
//!
//! Subscriptions are opened synchronously and deliver their messages into a
//! channel tagged with the caller's generation number; publishing and queries
//! are async.

#[cfg(any(test, feature = "test-util"))]
mod mock;
mod sdk;

#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockCall, MockTransport};
pub use sdk::NostrSdkTransport;

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::nostr::nip11::RelayDescriptor;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Relay could not be added or reached.
    #[error("connection to {relay} failed: {reason}")]
    Connection { relay: String, reason: String },

    /// Relay answered but refused the event.
    #[error("{relay} rejected event: {reason}")]
    Rejected { relay: String, reason: String },

    #[error("{relay} did not answer in time")]
    Timeout { relay: String },

    /// Subscription closed by the relay or failed to open.
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("query failed: {0}")]
    Query(String),

    /// Subscriptions must be opened from inside a tokio runtime.
    #[error("no async runtime available")]
    NoRuntime,
}

/// Opaque handle of an open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub(crate) u64);

/// Everything needed to open one subscription against one relay.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub relay: String,
    pub filter: Filter,
    /// Keys used to answer NIP-42 AUTH challenges on this subscription
    pub auth: Keys,
    /// Echoed back on every message so stale deliveries can be discarded
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    Event(Box<Event>),
    EndOfStoredEvents,
    /// The subscription ended (relay CLOSED, transport failure). No more messages follow.
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct SubscriptionEnvelope {
    pub generation: u64,
    pub message: SubscriptionMessage,
}

pub type SubscriptionSink = UnboundedSender<SubscriptionEnvelope>;

/// Transport trait for talking to relays.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a subscription. Must not block; messages arrive on `sink`.
    fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: SubscriptionSink,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// Close a subscription. After this returns no further message for the
    /// handle is delivered by the transport itself.
    fn close(&self, handle: SubscriptionHandle);

    /// Publish a signed event to a single relay, resolving once it acknowledges.
    async fn publish(&self, relay: &str, event: &Event) -> Result<(), TransportError>;

    /// Newest event matching `filter` across `relays`, if any.
    async fn fetch_latest(
        &self,
        relays: &[String],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Option<Event>, TransportError>;

    /// NIP-11 descriptor of a relay, `None` if unavailable for any reason.
    async fn fetch_descriptor(&self, relay: &str, timeout: Duration) -> Option<RelayDescriptor>;
}
