use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nostr_sdk::prelude::*;
use serde_json::{json, Value};
use signet_core::models::{bunker_uri, ProfileMetadata, RelayInfo, RelaySpec};
use signet_core::nostr::transport::RelayTransport;
use signet_core::nostr::url::normalize_url;
use signet_core::nostr::{DataChange, Reply, SyncCommand};
use signet_core::pow::{PowMiner, UnsignedRecord};
use signet_core::CoreRuntime;

use super::config::CliConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A logged-in engine plus the stream of its state changes.
pub struct Session {
    runtime: CoreRuntime,
    data_rx: Receiver<DataChange>,
}

impl Session {
    pub fn start(config: &CliConfig) -> Result<Self> {
        let runtime = CoreRuntime::new(config.core.clone())?;
        Self::login(runtime, config)
    }

    pub fn with_transport(config: &CliConfig, transport: Arc<dyn RelayTransport>) -> Result<Self> {
        let runtime = CoreRuntime::with_transport(config.core.clone(), transport)?;
        Self::login(runtime, config)
    }

    fn login(mut runtime: CoreRuntime, config: &CliConfig) -> Result<Self> {
        let keys = config.keys()?;
        let data_rx = runtime
            .take_data_rx()
            .context("Data channel already taken")?;
        let handle = runtime.handle();

        // Select the coordinator first so only one subscription gets opened.
        if let Some(url) = &config.coordinator {
            handle
                .send(SyncCommand::SetCoordinator { url: url.clone() })
                .map_err(|_| anyhow!("Sync worker stopped"))?;
        }
        handle
            .send(SyncCommand::Login { keys })
            .map_err(|_| anyhow!("Sync worker stopped"))?;

        Ok(Self { runtime, data_rx })
    }

    pub fn send(&self, command: SyncCommand) -> Result<()> {
        self.runtime
            .handle()
            .send(command)
            .map_err(|_| anyhow!("Sync worker stopped"))
    }

    /// Send a command carrying a reply channel and block until it answers.
    /// State changes arriving meanwhile go to `on_change`.
    pub fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SyncCommand,
        mut on_change: impl FnMut(&DataChange),
    ) -> Result<T> {
        let (tx, rx) = mpsc::channel();
        self.send(make(Some(tx)))?;
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => return result.map_err(|e| anyhow!(e)),
                Err(RecvTimeoutError::Timeout) => {
                    while let Ok(change) = self.data_rx.try_recv() {
                        on_change(&change);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("Sync worker dropped the request"))
                }
            }
        }
    }

    /// Next state change, or `None` after `timeout`.
    pub fn next_change(&self, timeout: Duration) -> Result<Option<DataChange>> {
        match self.data_rx.recv_timeout(timeout) {
            Ok(change) => Ok(Some(change)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("Sync worker stopped")),
        }
    }

    pub fn shutdown(mut self) {
        self.runtime.shutdown();
    }
}

/// Print PoW progress while a publish is being mined.
fn report_progress(change: &DataChange) {
    if let DataChange::PowProgress { kind, best, target } = change {
        eprintln!("kind {}: mining {}/{} bits", kind, best, target);
    }
}

pub fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}

/// JSON form of a state change for `watch`.
pub fn change_to_json(change: &DataChange) -> Value {
    match change {
        DataChange::BunkerProfiles(profiles) => json!({
            "type": "bunker_profiles",
            "profiles": profiles
                .as_ref()
                .map(|list| list.iter().map(|p| json!({
                    "name": p.name,
                    "uri": p.uri(),
                    "restrictions": p.restrictions,
                })).collect::<Vec<_>>()),
        }),
        DataChange::BunkerLoading(loading) => json!({
            "type": "bunker_loading",
            "loading": loading,
        }),
        DataChange::RelayList(relays) => json!({
            "type": "relay_list",
            "relays": relays,
        }),
        DataChange::Profile(profile) => json!({
            "type": "profile",
            "profile": profile,
        }),
        DataChange::PublishSucceeded {
            kind,
            event_id,
            relay,
        } => json!({
            "type": "publish_succeeded",
            "kind": kind,
            "event_id": event_id,
            "relay": relay,
        }),
        DataChange::PublishFailed { kind, error } => json!({
            "type": "publish_failed",
            "kind": kind,
            "error": error,
        }),
        DataChange::PowProgress { kind, best, target } => json!({
            "type": "pow_progress",
            "kind": kind,
            "best": best,
            "target": target,
        }),
        DataChange::SubscriptionError(error) => json!({
            "type": "subscription_error",
            "error": error,
        }),
    }
}

/// Flag raised on Ctrl-C.
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create signal runtime")?;
    let raised = flag.clone();
    std::thread::Builder::new()
        .name("signet-signal".to_string())
        .spawn(move || {
            if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                return;
            }
            raised.store(true, Ordering::SeqCst);
        })
        .context("Failed to spawn signal thread")?;
    Ok(flag)
}

/// Stream state changes until `stop` is raised.
pub fn watch(session: &Session, stop: &AtomicBool, pretty: bool) -> Result<()> {
    while !stop.load(Ordering::SeqCst) {
        if let Some(change) = session.next_change(POLL_INTERVAL)? {
            print_json(&change_to_json(&change), pretty)?;
        }
    }
    Ok(())
}

pub fn relays(session: &Session) -> Result<Vec<RelayInfo>> {
    session.call(
        |response_tx| SyncCommand::RefreshRelayList { response_tx },
        |_| {},
    )
}

/// Parse repeated `key=value` arguments.
pub fn parse_fields(fields: &[String]) -> Result<ProfileMetadata> {
    let mut metadata = ProfileMetadata::new();
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .with_context(|| format!("Expected key=value, got '{}'", field))?;
        if !metadata.set(key.trim(), value) {
            return Err(anyhow!("Unsupported profile field '{}'", key.trim()));
        }
    }
    Ok(metadata)
}

pub fn publish_profile(session: &Session, fields: ProfileMetadata) -> Result<String> {
    session.call(
        |response_tx| SyncCommand::PublishProfile {
            fields,
            response_tx,
        },
        report_progress,
    )
}

pub fn publish_relays(session: &Session, relays: &[String]) -> Result<String> {
    let relays: Vec<RelaySpec> = relays.iter().map(|r| RelaySpec::parse_marked(r)).collect();
    session.call(
        |response_tx| SyncCommand::PublishRelayList {
            relays,
            response_tx,
        },
        report_progress,
    )
}

/// Mine an unsigned record of `kind` to `difficulty` and describe the result.
pub fn mine(
    public_key: &PublicKey,
    kind: u16,
    content: &str,
    difficulty: u8,
    workers: usize,
) -> Result<Value> {
    let record = UnsignedRecord::new(public_key, kind, Vec::new(), content, Timestamp::now());
    let miner = PowMiner::new(workers);
    let mut last = 0;
    let mined = miner.mine(record, difficulty, |best| {
        if best > last {
            last = best;
            eprintln!("mining {}/{} bits", best, difficulty);
        }
    })?;

    Ok(json!({
        "id": mined.id_hex(),
        "nonce": mined.record.nonce(),
        "difficulty": mined.difficulty(),
        "record": mined.record,
    }))
}

/// Bunker URI for `host` on the (normalized) `coordinator`.
pub fn uri(host: &str, coordinator: &str, secret: &str) -> Result<String> {
    let coordinator = normalize_url(coordinator)
        .with_context(|| format!("Invalid coordinator url: {}", coordinator))?;
    Ok(bunker_uri(host, &coordinator, secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use signet_core::nostr::transport::MockTransport;
    use signet_core::CoreConfig;

    fn logged_in_config(keys: &Keys) -> CliConfig {
        CliConfig::default().with_overrides(Some(keys.secret_key().to_secret_hex()), None)
    }

    #[test]
    fn test_parse_fields() {
        let metadata = parse_fields(&["name=alice".to_string(), "about=a=b".to_string()]).unwrap();
        assert_eq!(metadata.get("name"), Some("alice"));
        assert_eq!(metadata.get("about"), Some("a=b"));

        assert!(parse_fields(&["name".to_string()]).is_err());
        assert!(parse_fields(&["lud06=x".to_string()]).is_err());
    }

    #[test]
    fn test_session_requires_credentials() {
        let result = Session::with_transport(&CliConfig::default(), Arc::new(MockTransport::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_session_subscribes_on_configured_coordinator() {
        let keys = Keys::generate();
        let mock = MockTransport::new();
        let mut config = logged_in_config(&keys);
        config.coordinator = Some("wss://bunker.example".to_string());

        let session = Session::with_transport(&config, Arc::new(mock.clone())).unwrap();
        loop {
            match session.next_change(Duration::from_secs(5)).unwrap() {
                Some(DataChange::BunkerLoading(true)) => break,
                Some(_) => continue,
                None => panic!("never started loading"),
            }
        }

        let subscribed: Vec<String> = mock
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                signet_core::nostr::transport::MockCall::Subscribe { relay, .. } => Some(relay),
                _ => None,
            })
            .collect();
        assert_eq!(subscribed, vec!["wss://bunker.example".to_string()]);
        session.shutdown();
    }

    #[test]
    fn test_publish_profile_returns_event_id() {
        let keys = Keys::generate();
        let mock = MockTransport::new();
        let config = logged_in_config(&keys);
        let session = Session::with_transport(&config, Arc::new(mock.clone())).unwrap();

        let fields = parse_fields(&["name=alice".to_string()]).unwrap();
        let event_id = publish_profile(&session, fields).unwrap();

        let published = mock.published();
        assert!(!published.is_empty());
        assert!(published.iter().all(|(_, e)| e.id.to_hex() == event_id));
        assert!(published
            .iter()
            .all(|(relay, _)| CoreConfig::default().index_relays.contains(relay)));
        session.shutdown();
    }

    #[test]
    fn test_relays_reports_empty_list_without_record() {
        let keys = Keys::generate();
        let session =
            Session::with_transport(&logged_in_config(&keys), Arc::new(MockTransport::new()))
                .unwrap();
        assert!(relays(&session).unwrap().is_empty());
        session.shutdown();
    }

    #[test]
    fn test_mine_reports_qualifying_nonce() {
        let keys = Keys::generate();
        let mined = mine(&keys.public_key(), 1, "hello", 6, 2).unwrap();
        let id = mined["id"].as_str().unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.starts_with('0'));
        assert!(mined["nonce"].as_u64().is_some());
        assert_eq!(mined["difficulty"].as_u64().map(|d| d >= 6), Some(true));
    }

    #[test]
    fn test_change_to_json_tags_the_variant() {
        let value = change_to_json(&DataChange::PowProgress {
            kind: 0,
            best: 3,
            target: 8,
        });
        assert_eq!(value["type"], "pow_progress");
        assert_eq!(value["target"], 8);

        let value = change_to_json(&DataChange::BunkerProfiles(None));
        assert!(value["profiles"].is_null());
    }

    #[test]
    fn test_uri_encodes_normalized_coordinator() {
        assert_eq!(
            uri("abc", "wss://relay.example", "s3").unwrap(),
            "bunker://abc?relay=wss%3A%2F%2Frelay.example&secret=s3"
        );
        assert_eq!(
            uri("abc", "promenade.fiatjaf.com", "s3").unwrap(),
            "bunker://abc?relay=wss%3A%2F%2Fpromenade.fiatjaf.com&secret=s3"
        );
    }
}
