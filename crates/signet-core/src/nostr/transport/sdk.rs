use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use super::{
    RelayTransport, SubscriptionEnvelope, SubscriptionHandle, SubscriptionMessage,
    SubscriptionRequest, SubscriptionSink, TransportError,
};
use crate::nostr::nip11::{fetch_relay_descriptor, RelayDescriptor};

/// How long a subscription waits for its relay before sending REQ anyway
const SUBSCRIBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a publish or query waits for its relays to connect
const PUBLISH_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// [`RelayTransport`] backed by `nostr-sdk`.
///
/// Every publish and query runs on its own signer-less client (events arrive
/// already signed) that is disconnected when the call returns, so no relay
/// outlives the call that named it. Each subscription gets its own client
/// carrying the subscriber's keys, so NIP-42 AUTH challenges are answered
/// with the identity that opened it, and closing it tears the whole
/// connection down.
pub struct NostrSdkTransport {
    http: reqwest::Client,
    next_id: AtomicU64,
    /// Cancellation senders of open subscriptions
    subscriptions: Mutex<HashMap<u64, watch::Sender<bool>>>,
}

impl Default for NostrSdkTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NostrSdkTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

fn connection_error(relay: &str, reason: impl std::fmt::Display) -> TransportError {
    TransportError::Connection {
        relay: relay.to_string(),
        reason: reason.to_string(),
    }
}

async fn add_relay(client: &Client, relay: &str) -> Result<(), TransportError> {
    client
        .add_relay(relay)
        .await
        .map_err(|e| connection_error(relay, e))?;
    client
        .connect_relay(relay)
        .await
        .map_err(|e| connection_error(relay, e))?;
    Ok(())
}

async fn publish_on(client: &Client, relay: &str, event: &Event) -> Result<(), TransportError> {
    add_relay(client, relay).await?;
    client.wait_for_connection(PUBLISH_CONNECT_TIMEOUT).await;

    let output = client
        .send_event_to([relay], event)
        .await
        .map_err(|e| TransportError::Rejected {
            relay: relay.to_string(),
            reason: e.to_string(),
        })?;

    if output.success.is_empty() {
        let reason = output
            .failed
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| "no acknowledgement".to_string());
        return Err(TransportError::Rejected {
            relay: relay.to_string(),
            reason,
        });
    }
    Ok(())
}

async fn fetch_on(
    client: &Client,
    relays: &[String],
    filter: Filter,
    timeout: Duration,
) -> Result<Option<Event>, TransportError> {
    let mut reachable = Vec::with_capacity(relays.len());
    for relay in relays {
        match add_relay(client, relay).await {
            Ok(()) => reachable.push(relay.as_str()),
            Err(e) => tracing::warn!(error = %e, "skipping relay for query"),
        }
    }
    if reachable.is_empty() {
        return Err(TransportError::Query("no reachable relay".to_string()));
    }
    client.wait_for_connection(PUBLISH_CONNECT_TIMEOUT).await;

    let events = client
        .fetch_events_from(reachable, filter, timeout)
        .await
        .map_err(|e| TransportError::Query(e.to_string()))?;
    Ok(events.into_iter().max_by_key(|e| e.created_at))
}

fn send(sink: &SubscriptionSink, generation: u64, message: SubscriptionMessage) {
    // Receiver gone means the control loop shut down; nothing left to notify.
    let _ = sink.send(SubscriptionEnvelope {
        generation,
        message,
    });
}

/// Resolves once the subscription is closed or its transport is dropped.
async fn cancellation(cancel_rx: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which cancels as well.
    let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
}

async fn open_subscription(
    client: &Client,
    relay: &str,
    filter: Filter,
) -> Result<(broadcast::Receiver<RelayPoolNotification>, SubscriptionId), String> {
    client.add_relay(relay).await.map_err(|e| e.to_string())?;
    client.connect_relay(relay).await.map_err(|e| e.to_string())?;
    client.wait_for_connection(SUBSCRIBE_CONNECT_TIMEOUT).await;

    // Take the receiver before REQ so the first EVENT/EOSE cannot be missed.
    let notifications = client.notifications();
    let output = client
        .subscribe_to([relay], filter, None)
        .await
        .map_err(|e| e.to_string())?;
    Ok((notifications, output.val))
}

async fn run_subscription(
    client: Client,
    request: SubscriptionRequest,
    sink: SubscriptionSink,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let generation = request.generation;
    let relay = request.relay.clone();

    let opened = tokio::select! {
        _ = cancellation(&mut cancel_rx) => {
            tracing::debug!(relay = %relay, generation, "subscription cancelled while connecting");
            client.disconnect().await;
            return;
        }
        result = open_subscription(&client, &relay, request.filter) => result,
    };

    let (mut notifications, sub_id) = match opened {
        Ok(v) => v,
        Err(reason) => {
            tracing::warn!(relay = %relay, generation, %reason, "failed to open subscription");
            send(&sink, generation, SubscriptionMessage::Closed(reason));
            client.disconnect().await;
            return;
        }
    };
    tracing::info!(relay = %relay, generation, sub_id = %sub_id, "subscription open");

    loop {
        tokio::select! {
            _ = cancellation(&mut cancel_rx) => {
                tracing::debug!(relay = %relay, generation, "subscription cancelled");
                break;
            }
            result = notifications.recv() => {
                match result {
                    Ok(RelayPoolNotification::Event { subscription_id, event, .. }) => {
                        if subscription_id == sub_id {
                            send(&sink, generation, SubscriptionMessage::Event(event));
                        }
                    }
                    Ok(RelayPoolNotification::Message { message: relay_message, .. }) => {
                        match relay_message {
                            RelayMessage::EndOfStoredEvents(id) if id.to_string() == sub_id.to_string() => {
                                send(&sink, generation, SubscriptionMessage::EndOfStoredEvents);
                            }
                            RelayMessage::Closed { subscription_id, message }
                                if subscription_id.to_string() == sub_id.to_string() =>
                            {
                                let reason = message.to_string();
                                // The client answers AUTH with its signer and re-sends REQ itself.
                                if reason.starts_with("auth-required") {
                                    tracing::debug!(relay = %relay, generation, "subscription awaiting AUTH");
                                    continue;
                                }
                                tracing::warn!(relay = %relay, generation, %reason, "relay closed subscription");
                                send(&sink, generation, SubscriptionMessage::Closed(reason));
                                break;
                            }
                            _ => {}
                        }
                    }
                    Ok(RelayPoolNotification::Shutdown) => {
                        send(&sink, generation, SubscriptionMessage::Closed("relay pool shut down".to_string()));
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(relay = %relay, generation, skipped, "subscription notifications lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        send(&sink, generation, SubscriptionMessage::Closed("notification channel closed".to_string()));
                        break;
                    }
                }
            }
        }
    }

    client.unsubscribe(&sub_id).await;
    client.disconnect().await;
    tracing::debug!(relay = %relay, generation, "subscription torn down");
}

#[async_trait]
impl RelayTransport for NostrSdkTransport {
    fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: SubscriptionSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.subscriptions.lock().insert(id, cancel_tx);

        let client = Client::builder().signer(request.auth.clone()).build();
        runtime.spawn(run_subscription(client, request, sink, cancel_rx));
        Ok(SubscriptionHandle(id))
    }

    fn close(&self, handle: SubscriptionHandle) {
        if let Some(cancel_tx) = self.subscriptions.lock().remove(&handle.0) {
            let _ = cancel_tx.send(true);
        }
    }

    async fn publish(&self, relay: &str, event: &Event) -> Result<(), TransportError> {
        let client = Client::default();
        let result = publish_on(&client, relay, event).await;
        client.disconnect().await;
        result
    }

    async fn fetch_latest(
        &self,
        relays: &[String],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Option<Event>, TransportError> {
        let client = Client::default();
        let result = fetch_on(&client, relays, filter, timeout).await;
        client.disconnect().await;
        result
    }

    async fn fetch_descriptor(&self, relay: &str, timeout: Duration) -> Option<RelayDescriptor> {
        fetch_relay_descriptor(&self.http, relay, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_cancellation_on_close() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        tokio::time::timeout(SHORT, cancellation(&mut cancel_rx))
            .await
            .expect("close did not cancel");
    }

    #[tokio::test]
    async fn test_cancellation_when_transport_dropped() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        drop(cancel_tx);
        tokio::time::timeout(SHORT, cancellation(&mut cancel_rx))
            .await
            .expect("dropped sender did not cancel");
        // Stays resolved instead of firing once and re-arming.
        tokio::time::timeout(SHORT, cancellation(&mut cancel_rx))
            .await
            .expect("dropped sender did not cancel again");
    }

    #[tokio::test]
    async fn test_no_cancellation_while_open() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        cancel_tx.send(false).unwrap();
        assert!(tokio::time::timeout(SHORT, cancellation(&mut cancel_rx))
            .await
            .is_err());
        drop(cancel_tx);
    }

    fn sample_event() -> Event {
        EventBuilder::text_note("hello")
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_to_invalid_relay_fails_without_pool() {
        let transport = NostrSdkTransport::new();
        let err = transport
            .publish("not a relay url", &sample_event())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection { ref relay, .. } if relay == "not a relay url"));
    }

    #[tokio::test]
    async fn test_query_with_no_usable_relay() {
        let transport = NostrSdkTransport::new();
        let err = transport
            .fetch_latest(
                &["not a relay url".to_string(), "http://".to_string()],
                Filter::new().kind(Kind::Metadata),
                SHORT,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Query(_)));
    }
}
