//! Application-wide constants
//!
//! Centralized location for relay lists, record kinds and tuning values
//! that are used across multiple modules.

/// Baseline discovery relays. Profile and relay-list records are always
/// published here and fetched from here.
pub const INDEX_RELAYS: &[&str] = &[
    "wss://purplepag.es",
    "wss://user.kindpag.es",
    "wss://relay.nostr.band",
    "wss://relay.nos.social",
    "wss://relay.damus.io",
];

/// Coordination endpoints that host bunker-config records.
/// The first entry is the default selection.
pub const COORDINATORS: &[&str] = &["promenade.fiatjaf.com", "frostbunker.njump.me"];

/// Profile metadata fields that survive a merge. Anything else is dropped.
pub const PROFILE_FIELDS: &[&str] = &[
    "name",
    "picture",
    "about",
    "display_name",
    "website",
    "birthday",
    "nip05",
    "lud16",
    "banner",
];

/// Number of proof-of-work threads when the config does not say otherwise
pub const DEFAULT_POW_WORKERS: usize = 4;

/// Per-destination publish timeout
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

/// NIP-11 descriptor request timeout
pub const DEFAULT_NIP11_TIMEOUT_SECS: u64 = 5;

/// Timeout for one-shot "latest record" queries
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 8;

/// Accept header value for relay capability discovery (NIP-11)
pub const NIP11_ACCEPT: &str = "application/nostr+json";

// Nostr event kinds used by signet
pub mod kinds {
    /// Profile metadata (NIP-01)
    pub const METADATA: u16 = 0;
    /// Relay list (NIP-65)
    pub const RELAY_LIST: u16 = 10002;
    /// Bunker configuration hosted on the coordination endpoint
    pub const BUNKER_CONFIG: u16 = 16430;
}
