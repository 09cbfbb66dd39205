use nostr_sdk::prelude::*;

use crate::models::bunker::{ingest_bunker_event, BunkerProfile};
use crate::models::tag_utils::raw_tags;

/// Load state of the bunker-config record for the active identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BunkerStatus {
    /// No credentials, no subscription.
    #[default]
    Idle,
    /// Subscription open, nothing usable received yet.
    Loading,
    /// A record was received and parsed.
    Loaded {
        event_id: EventId,
        created_at: Timestamp,
    },
    /// The relay finished sending stored events and had no record.
    Empty,
    /// The last record received was structurally invalid.
    Invalid,
}

/// What [`BunkerState::apply_record`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied,
    /// Older than the record already loaded.
    Stale,
    /// Structurally invalid; the profile list was reset.
    Invalid,
}

/// Reactive bunker state the UI renders from.
///
/// `profiles` is `None` until the first record or end-of-stored-events, which
/// keeps "not loaded yet" apart from "loaded, nothing configured".
#[derive(Debug, Clone, Default)]
pub struct BunkerState {
    pub status: BunkerStatus,
    pub profiles: Option<Vec<BunkerProfile>>,
    /// Tags of the last valid record, kept so renames can rebuild it
    record_tags: Option<Vec<Vec<String>>>,
}

impl BunkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A fresh subscription was opened.
    pub fn begin_loading(&mut self) {
        self.status = BunkerStatus::Loading;
        self.profiles = None;
        self.record_tags = None;
    }

    /// Ingest a bunker-config record. Marks the state as loading before parsing,
    /// so a record that fails to parse never leaves the previous one looking
    /// confirmed. An invalid record resets the profile list to empty.
    pub fn apply_record(&mut self, event: &Event, coordinator: &str) -> RecordOutcome {
        if let BunkerStatus::Loaded { created_at, .. } = self.status {
            if event.created_at < created_at {
                tracing::debug!(event_id = %event.id, "ignoring older bunker config record");
                return RecordOutcome::Stale;
            }
        }

        self.status = BunkerStatus::Loading;
        let previous = self.profiles.take().unwrap_or_default();

        match ingest_bunker_event(&previous, event, coordinator) {
            Ok(profiles) => {
                tracing::info!(event_id = %event.id, profiles = profiles.len(), "bunker config loaded");
                self.profiles = Some(profiles);
                self.record_tags = Some(raw_tags(event));
                self.status = BunkerStatus::Loaded {
                    event_id: event.id,
                    created_at: event.created_at,
                };
                RecordOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(error = %e, "invalid bunker config record, resetting profile list");
                self.profiles = Some(Vec::new());
                self.record_tags = None;
                self.status = BunkerStatus::Invalid;
                RecordOutcome::Invalid
            }
        }
    }

    /// End of stored events. Returns true if that settled the state.
    pub fn end_of_stored_events(&mut self) -> bool {
        if self.status != BunkerStatus::Loading {
            return false;
        }
        self.status = BunkerStatus::Empty;
        if self.profiles.is_none() {
            self.profiles = Some(Vec::new());
        }
        true
    }

    pub fn is_loading(&self) -> bool {
        self.status == BunkerStatus::Loading
    }

    pub fn record_tags(&self) -> Option<&[Vec<String>]> {
        self.record_tags.as_deref()
    }

    pub fn profile_mut(&mut self, uri: &str) -> Option<&mut BunkerProfile> {
        self.profiles
            .as_mut()
            .and_then(|profiles| profiles.iter_mut().find(|p| p.uri() == uri))
    }

    /// Profiles for display, empty while still loading.
    pub fn profiles_or_empty(&self) -> Vec<BunkerProfile> {
        self.profiles.clone().unwrap_or_default()
    }
}
