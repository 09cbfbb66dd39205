//! Synchronization and publishing engine for a nostr identity manager.
//!
//! Keeps a user's profile metadata, relay list and remote-signer (bunker)
//! configuration consistent between local state and the relays holding them.

pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod models;
pub mod nostr;
pub mod pow;
pub mod runtime;
pub mod store;

pub use config::{ConfigError, CoreConfig};
pub use credentials::{CredentialContext, Credentials};
pub use error::{CoreError, Result};
pub use runtime::{CoreHandle, CoreRuntime};
