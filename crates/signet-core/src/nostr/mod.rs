pub mod auth;
pub mod fetch;
pub mod nip11;
pub mod publish;
pub mod subscriptions;
pub mod transport;
pub mod url;
pub mod worker;

pub use auth::{encrypt_keys, load_keys, needs_password};
pub use publish::{BroadcastAggregator, BroadcastState, Broadcaster, PublishError};
pub use subscriptions::{SubscriptionManager, SubscriptionUpdate};
pub use transport::{NostrSdkTransport, RelayTransport, TransportError};
pub use worker::{DataChange, Reply, SyncCommand, SyncWorker};
