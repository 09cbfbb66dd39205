use crate::config::ConfigError;
use crate::models::bunker::IngestError;
use crate::nostr::publish::PublishError;
use crate::nostr::transport::TransportError;
use crate::pow::PowError;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("No coordination endpoint selected")]
    NoCoordinator,

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid tag {0}")]
    InvalidTag(String),

    #[error("Failed to sign event: {0}")]
    Signing(String),

    #[error("No bunker configuration loaded")]
    NoBunkerRecord,

    #[error("No bunker profile with uri {0}")]
    UnknownProfile(String),

    #[error("Worker unavailable: {0}")]
    WorkerGone(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Pow(#[from] PowError),
}
