pub mod bunker;
pub mod metadata;
pub mod relay;
pub mod tag_utils;

pub use bunker::{bunker_uri, BunkerProfile, IngestError};
pub use metadata::ProfileMetadata;
pub use relay::{RelayInfo, RelaySpec};
