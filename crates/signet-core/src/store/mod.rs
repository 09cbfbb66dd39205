pub mod cache;
pub mod state;

pub use cache::{LocalCache, Origin, Versioned};
pub use state::{BunkerState, BunkerStatus, RecordOutcome};
