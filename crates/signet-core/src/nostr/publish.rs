//! Any-succeeds broadcast of signed events to a set of relays.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nostr_sdk::prelude::*;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::nostr::transport::{RelayTransport, TransportError};
use crate::nostr::url::normalize_url;
use crate::pow::{PowCancel, PowError, PowMiner, UnsignedRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFailure {
    pub relay: String,
    pub error: TransportError,
}

impl fmt::Display for DestinationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.relay, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("no destination relays")]
    NoDestinations,

    /// Every destination failed; one entry per destination.
    #[error("all {} destinations failed: {}", .0.len(), join_failures(.0))]
    AllFailed(Vec<DestinationFailure>),
}

fn join_failures(failures: &[DestinationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a broadcast so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastState {
    /// Some destinations have not answered and none succeeded.
    Pending,
    /// The first destination that acknowledged.
    Succeeded(String),
    /// Every destination failed.
    Failed(Vec<DestinationFailure>),
}

/// Folds per-destination outcomes into a [`BroadcastState`].
///
/// Settles on the first success. Failures are collected and only settle the
/// state once every expected destination has reported.
#[derive(Debug)]
pub struct BroadcastAggregator {
    expected: usize,
    failures: Vec<DestinationFailure>,
    state: BroadcastState,
}

impl BroadcastAggregator {
    pub fn new(expected: usize) -> Self {
        let state = if expected == 0 {
            BroadcastState::Failed(Vec::new())
        } else {
            BroadcastState::Pending
        };
        Self {
            expected,
            failures: Vec::new(),
            state,
        }
    }

    pub fn record(&mut self, relay: &str, outcome: Result<(), TransportError>) -> &BroadcastState {
        if self.state != BroadcastState::Pending {
            return &self.state;
        }
        match outcome {
            Ok(()) => {
                self.state = BroadcastState::Succeeded(relay.to_string());
            }
            Err(error) => {
                self.failures.push(DestinationFailure {
                    relay: relay.to_string(),
                    error,
                });
                if self.failures.len() >= self.expected {
                    self.state = BroadcastState::Failed(std::mem::take(&mut self.failures));
                }
            }
        }
        &self.state
    }

    pub fn state(&self) -> &BroadcastState {
        &self.state
    }

    pub fn is_settled(&self) -> bool {
        self.state != BroadcastState::Pending
    }
}

/// Baseline relays followed by write relays, normalized and deduplicated in
/// order. Entries that do not parse as URLs are dropped.
pub fn destination_set(baseline: &[String], write_relays: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(baseline.len() + write_relays.len());
    for raw in baseline.iter().chain(write_relays) {
        match normalize_url(raw) {
            Ok(url) => {
                if !out.contains(&url) {
                    out.push(url);
                }
            }
            Err(e) => tracing::warn!(relay = %raw, error = %e, "skipping invalid destination"),
        }
    }
    out
}

pub struct Broadcaster {
    transport: Arc<dyn RelayTransport>,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn RelayTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Publish `event` to every destination. Resolves with the first relay that
    /// acknowledged, or fails once all have failed. Publishes still in flight
    /// when this returns keep running and only log their outcome.
    pub async fn publish(&self, destinations: &[String], event: &Event) -> Result<String, PublishError> {
        if destinations.is_empty() {
            return Err(PublishError::NoDestinations);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for relay in destinations {
            let transport = self.transport.clone();
            let relay = relay.clone();
            let event = event.clone();
            let timeout = self.timeout;
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match tokio::time::timeout(timeout, transport.publish(&relay, &event)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout {
                        relay: relay.clone(),
                    }),
                };
                match &outcome {
                    Ok(()) => tracing::debug!(relay = %relay, event_id = %event.id, "relay accepted event"),
                    Err(e) => tracing::warn!(relay = %relay, event_id = %event.id, error = %e, "relay publish failed"),
                }
                let _ = tx.send((relay, outcome));
            });
        }
        drop(tx);

        let mut aggregator = BroadcastAggregator::new(destinations.len());
        while let Some((relay, outcome)) = rx.recv().await {
            match aggregator.record(&relay, outcome) {
                BroadcastState::Pending => continue,
                BroadcastState::Succeeded(relay) => {
                    tracing::info!(relay = %relay, event_id = %event.id, kind = event.kind.as_u16(), "event published");
                    return Ok(relay.clone());
                }
                BroadcastState::Failed(failures) => {
                    tracing::error!(event_id = %event.id, failures = failures.len(), "event rejected by every destination");
                    return Err(PublishError::AllFailed(failures.clone()));
                }
            }
        }

        // Only reachable if a publish task died without reporting.
        Err(PublishError::AllFailed(Vec::new()))
    }

    /// Highest `min_pow_difficulty` advertised by any destination.
    pub async fn required_difficulty(&self, destinations: &[String], timeout: Duration) -> u8 {
        let lookups = destinations
            .iter()
            .map(|relay| self.transport.fetch_descriptor(relay, timeout));
        join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .map(|d| d.min_pow_difficulty())
            .max()
            .unwrap_or(0)
    }
}

/// Sign `record`, mining it first when `difficulty > 0`. Mining runs on the
/// blocking pool; progress is forwarded to `on_progress`.
pub async fn sign_record(
    keys: &Keys,
    record: UnsignedRecord,
    difficulty: u8,
    miner: PowMiner,
    on_progress: impl FnMut(u8) + Send + 'static,
    on_start: impl FnOnce(PowCancel),
) -> Result<Event, PowError> {
    let job = miner.start(record, difficulty)?;
    on_start(job.canceller());
    let mined = tokio::task::spawn_blocking(move || job.wait(on_progress))
        .await
        .map_err(|e| PowError::Spawn(e.to_string()))??;
    if difficulty > 0 {
        tracing::info!(difficulty, achieved = mined.difficulty(), id = %mined.id_hex(), "mined event");
    }
    mined.sign(keys)
}
