//! The control loop that owns all reactive state.
//!
//! `SyncWorker` runs on its own thread inside a tokio runtime. It receives
//! [`SyncCommand`]s, subscription deliveries and completions of the tasks it
//! spawned on one `select!` loop, so no two state updates ever overlap.
//! Publishes and fetches run as separate tasks; their results are only
//! applied if the identity that started them is still the active one.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::mpsc::{self as tokio_mpsc, UnboundedReceiver, UnboundedSender};

use crate::config::CoreConfig;
use crate::constants::kinds;
use crate::credentials::CredentialContext;
use crate::error::CoreError;
use crate::models::bunker::{rename_profile_tags, BunkerProfile};
use crate::models::metadata::ProfileMetadata;
use crate::models::relay::{relay_list_tags, write_relays, RelayInfo, RelaySpec};
use crate::nostr::fetch::{enrich_relays, fetch_profile, fetch_relay_list};
use crate::nostr::publish::{destination_set, sign_record, Broadcaster};
use crate::nostr::subscriptions::{SubscriptionManager, SubscriptionUpdate};
use crate::nostr::transport::{RelayTransport, SubscriptionEnvelope};
use crate::pow::{PowCancel, PowMiner, UnsignedRecord};
use crate::store::{LocalCache, Origin};

/// Optional reply channel carried by a command.
pub type Reply<T> = Option<Sender<Result<T, String>>>;

fn reply<T>(reply: Reply<T>, result: Result<T, String>) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}

pub enum SyncCommand {
    Login {
        keys: Keys,
    },
    Logout,
    SetCoordinator {
        url: String,
    },
    /// Merge `fields` over the latest known metadata and publish it.
    PublishProfile {
        fields: ProfileMetadata,
        /// Replies with the published event id
        response_tx: Reply<String>,
    },
    PublishRelayList {
        relays: Vec<RelaySpec>,
        response_tx: Reply<String>,
    },
    RefreshRelayList {
        response_tx: Reply<Vec<RelayInfo>>,
    },
    RefreshProfile {
        response_tx: Reply<ProfileMetadata>,
    },
    RenameBunkerProfile {
        uri: String,
        new_name: String,
        response_tx: Reply<String>,
    },
    SetProfileExpanded {
        uri: String,
        expanded: bool,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum DataChange {
    /// `None` while the bunker config has not loaded yet
    BunkerProfiles(Option<Vec<BunkerProfile>>),
    BunkerLoading(bool),
    RelayList(Vec<RelayInfo>),
    Profile(ProfileMetadata),
    PublishSucceeded {
        kind: u16,
        event_id: String,
        relay: String,
    },
    PublishFailed {
        kind: u16,
        error: String,
    },
    PowProgress {
        kind: u16,
        best: u8,
        target: u8,
    },
    SubscriptionError(String),
}

/// Value to write into local state once a publish succeeded.
#[derive(Debug, Clone)]
enum Optimistic {
    Profile(ProfileMetadata),
    RelayList(Vec<RelaySpec>),
    BunkerConfig,
}

/// Completions of spawned tasks, fed back into the control loop.
enum TaskDone {
    MiningStarted {
        task_id: u64,
        cancel: PowCancel,
    },
    Published {
        task_id: u64,
        identity_generation: u64,
        public_key: PublicKey,
        kind: u16,
        outcome: Result<(Event, String, Optimistic), String>,
        response_tx: Reply<String>,
    },
    RelayListFetched {
        identity_generation: u64,
        public_key: PublicKey,
        outcome: Result<Option<(Vec<RelaySpec>, Timestamp)>, String>,
        response_tx: Reply<Vec<RelayInfo>>,
    },
    ProfileFetched {
        identity_generation: u64,
        public_key: PublicKey,
        outcome: Result<Option<(ProfileMetadata, Timestamp)>, String>,
        response_tx: Reply<ProfileMetadata>,
    },
    RelayListEnriched {
        identity_generation: u64,
        public_key: PublicKey,
        /// The list the lookups were started for
        specs: Vec<RelaySpec>,
        infos: Vec<RelayInfo>,
        response_tx: Reply<Vec<RelayInfo>>,
    },
}

/// Everything a spawned task needs, cheap to clone.
#[derive(Clone)]
struct TaskContext {
    transport: Arc<dyn RelayTransport>,
    broadcaster: Arc<Broadcaster>,
    miner: PowMiner,
    data_tx: Sender<DataChange>,
    task_tx: UnboundedSender<TaskDone>,
    index_relays: Vec<String>,
    fetch_timeout: Duration,
    nip11_timeout: Duration,
}

impl TaskContext {
    /// Sign (mining first if any destination demands it) and broadcast.
    async fn sign_and_broadcast(
        &self,
        task_id: u64,
        keys: &Keys,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
        destinations: &[String],
    ) -> Result<(Event, String), CoreError> {
        let difficulty = self
            .broadcaster
            .required_difficulty(destinations, self.nip11_timeout)
            .await;
        let record = UnsignedRecord::new(&keys.public_key(), kind, tags, content, Timestamp::now());

        let data_tx = self.data_tx.clone();
        let task_tx = self.task_tx.clone();
        let event = sign_record(
            keys,
            record,
            difficulty,
            self.miner,
            move |best| {
                let _ = data_tx.send(DataChange::PowProgress {
                    kind,
                    best,
                    target: difficulty,
                });
            },
            |cancel| {
                if difficulty > 0 {
                    let _ = task_tx.send(TaskDone::MiningStarted { task_id, cancel });
                }
            },
        )
        .await?;

        let relay = self.broadcaster.publish(destinations, &event).await?;
        Ok((event, relay))
    }

    /// Write relays of `public_key`, from `cached` or fetched when unknown.
    async fn write_relays_of(
        &self,
        public_key: PublicKey,
        cached: Option<Vec<RelaySpec>>,
    ) -> Vec<String> {
        let specs = match cached {
            Some(specs) => specs,
            None => match fetch_relay_list(
                self.transport.as_ref(),
                &self.index_relays,
                public_key,
                self.fetch_timeout,
            )
            .await
            {
                Ok(fetched) => fetched.map(|f| f.value).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(error = %e, "could not load relay list, publishing to index relays only");
                    Vec::new()
                }
            },
        };
        write_relays(&specs)
    }
}

pub struct SyncWorker {
    ctx: TaskContext,
    credentials: CredentialContext,
    subscriptions: SubscriptionManager,
    cache: LocalCache,
    relay_infos: Vec<RelayInfo>,
    command_rx: UnboundedReceiver<SyncCommand>,
    envelope_rx: UnboundedReceiver<SubscriptionEnvelope>,
    task_rx: UnboundedReceiver<TaskDone>,
    /// Cancel handles of running PoW jobs, by publish task
    mining: HashMap<u64, PowCancel>,
    next_task_id: u64,
}

impl SyncWorker {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn RelayTransport>,
        data_tx: Sender<DataChange>,
        command_rx: UnboundedReceiver<SyncCommand>,
    ) -> Self {
        let (envelope_tx, envelope_rx) = tokio_mpsc::unbounded_channel();
        let (task_tx, task_rx) = tokio_mpsc::unbounded_channel();

        let mut credentials = CredentialContext::new();
        if let Some(coordinator) = config.default_coordinator() {
            if let Err(e) = credentials.set_coordinator(coordinator) {
                tracing::warn!(coordinator, error = %e, "ignoring invalid default coordinator");
            }
        }

        let ctx = TaskContext {
            transport: transport.clone(),
            broadcaster: Arc::new(Broadcaster::new(transport.clone(), config.publish_timeout())),
            miner: PowMiner::new(config.pow_workers),
            data_tx,
            task_tx,
            index_relays: config.index_relays.clone(),
            fetch_timeout: config.fetch_timeout(),
            nip11_timeout: config.nip11_timeout(),
        };

        Self {
            subscriptions: SubscriptionManager::new(transport, envelope_tx),
            ctx,
            credentials,
            cache: LocalCache::new(),
            relay_infos: Vec::new(),
            command_rx,
            envelope_rx,
            task_rx,
            mining: HashMap::new(),
            next_task_id: 0,
        }
    }

    /// Run the control loop until `Shutdown` or until every command sender is gone.
    pub async fn run(mut self) {
        tracing::info!("sync worker started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(envelope) = self.envelope_rx.recv() => self.handle_envelope(envelope),
                Some(done) = self.task_rx.recv() => self.handle_task(done),
            }
        }

        self.cancel_mining();
        self.subscriptions.teardown();
        tracing::info!("sync worker stopped");
    }

    fn emit(&self, change: DataChange) {
        let _ = self.ctx.data_tx.send(change);
    }

    fn emit_bunker(&self) {
        self.emit(DataChange::BunkerLoading(self.subscriptions.state.is_loading()));
        self.emit(DataChange::BunkerProfiles(
            self.subscriptions.state.profiles.clone(),
        ));
    }

    fn next_task(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Login { keys } => self.handle_login(keys),
            SyncCommand::Logout => self.handle_logout(),
            SyncCommand::SetCoordinator { url } => match self.credentials.set_coordinator(&url) {
                Ok(true) => self.resubscribe(),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "rejected coordinator");
                    self.emit(DataChange::SubscriptionError(e.to_string()));
                }
            },
            SyncCommand::PublishProfile {
                fields,
                response_tx,
            } => self.handle_publish_profile(fields, response_tx),
            SyncCommand::PublishRelayList {
                relays,
                response_tx,
            } => self.handle_publish_relay_list(relays, response_tx),
            SyncCommand::RefreshRelayList { response_tx } => self.spawn_relay_list_fetch(response_tx),
            SyncCommand::RefreshProfile { response_tx } => self.spawn_profile_fetch(response_tx),
            SyncCommand::RenameBunkerProfile {
                uri,
                new_name,
                response_tx,
            } => self.handle_rename(uri, new_name, response_tx),
            SyncCommand::SetProfileExpanded { uri, expanded } => {
                if let Some(profile) = self.subscriptions.state.profile_mut(&uri) {
                    profile.expanded = expanded;
                    self.emit_bunker();
                }
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn handle_login(&mut self, keys: Keys) {
        if !self.credentials.login(&keys) {
            return;
        }
        tracing::info!(pubkey = %keys.public_key(), "logged in");
        self.cancel_mining();
        self.relay_infos.clear();
        self.resubscribe();
        self.spawn_relay_list_fetch(None);
        self.spawn_profile_fetch(None);
    }

    fn handle_logout(&mut self) {
        let previous = self.credentials.public_key();
        if !self.credentials.logout() {
            return;
        }
        tracing::info!("logged out");
        self.cancel_mining();
        if let Some(public_key) = previous {
            self.cache.forget(&public_key);
        }
        self.relay_infos.clear();
        self.resubscribe();
        self.emit(DataChange::RelayList(Vec::new()));
        self.emit(DataChange::Profile(ProfileMetadata::new()));
    }

    fn resubscribe(&mut self) {
        let credentials = self.credentials.current().clone();
        if let Err(e) = self.subscriptions.apply(&credentials) {
            self.emit(DataChange::SubscriptionError(e.to_string()));
        }
        self.emit_bunker();
    }

    fn cancel_mining(&mut self) {
        for (task_id, cancel) in self.mining.drain() {
            tracing::debug!(task_id, "cancelling proof-of-work");
            cancel.cancel();
        }
    }

    fn handle_envelope(&mut self, envelope: SubscriptionEnvelope) {
        match self.subscriptions.handle(envelope) {
            Some(SubscriptionUpdate::Profiles) => self.emit_bunker(),
            Some(SubscriptionUpdate::Closed(reason)) => {
                self.emit(DataChange::SubscriptionError(reason));
                self.emit_bunker();
            }
            None => {}
        }
    }

    /// Identity and signing keys, or a reply explaining why there are none.
    fn session<T>(&self, response_tx: &Reply<T>, kind: u16) -> Option<(u64, Keys)> {
        match self.credentials.keys() {
            Some(keys) => Some((self.credentials.identity_generation(), keys)),
            None => {
                let error = CoreError::NotLoggedIn.to_string();
                if let Some(tx) = response_tx {
                    let _ = tx.send(Err(error.clone()));
                }
                self.emit(DataChange::PublishFailed { kind, error });
                None
            }
        }
    }

    fn handle_publish_profile(&mut self, fields: ProfileMetadata, response_tx: Reply<String>) {
        let Some((identity_generation, keys)) = self.session(&response_tx, kinds::METADATA) else {
            return;
        };
        let public_key = keys.public_key();
        let existing = self.cache.profile(&public_key).map(|v| v.value.clone());
        let relays = self.cache.relay_list(&public_key).map(|v| v.value.clone());
        let task_id = self.next_task();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let outcome = async {
                let existing = match existing {
                    Some(existing) => existing,
                    None => fetch_profile(
                        ctx.transport.as_ref(),
                        &ctx.index_relays,
                        public_key,
                        ctx.fetch_timeout,
                    )
                    .await?
                    .map(|f| f.value)
                    .unwrap_or_default(),
                };
                let merged = existing.merge(&fields);
                let write = ctx.write_relays_of(public_key, relays).await;
                let destinations = destination_set(&ctx.index_relays, &write);
                let (event, relay) = ctx
                    .sign_and_broadcast(
                        task_id,
                        &keys,
                        kinds::METADATA,
                        Vec::new(),
                        merged.to_content(),
                        &destinations,
                    )
                    .await?;
                Ok::<_, CoreError>((event, relay, Optimistic::Profile(merged)))
            }
            .await;

            let _ = ctx.task_tx.send(TaskDone::Published {
                task_id,
                identity_generation,
                public_key,
                kind: kinds::METADATA,
                outcome: outcome.map_err(|e| e.to_string()),
                response_tx,
            });
        });
    }

    fn handle_publish_relay_list(&mut self, relays: Vec<RelaySpec>, response_tx: Reply<String>) {
        let Some((identity_generation, keys)) = self.session(&response_tx, kinds::RELAY_LIST) else {
            return;
        };
        let public_key = keys.public_key();
        let task_id = self.next_task();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let destinations = destination_set(&ctx.index_relays, &write_relays(&relays));
            let outcome = ctx
                .sign_and_broadcast(
                    task_id,
                    &keys,
                    kinds::RELAY_LIST,
                    relay_list_tags(&relays),
                    String::new(),
                    &destinations,
                )
                .await
                .map(|(event, relay)| (event, relay, Optimistic::RelayList(relays)))
                .map_err(|e| e.to_string());

            let _ = ctx.task_tx.send(TaskDone::Published {
                task_id,
                identity_generation,
                public_key,
                kind: kinds::RELAY_LIST,
                outcome,
                response_tx,
            });
        });
    }

    fn handle_rename(&mut self, uri: String, new_name: String, response_tx: Reply<String>) {
        let Some((identity_generation, keys)) = self.session(&response_tx, kinds::BUNKER_CONFIG)
        else {
            return;
        };
        let prepared = match (
            self.subscriptions.coordinator(),
            self.subscriptions.state.record_tags(),
        ) {
            (Some(coordinator), Some(tags)) => {
                rename_profile_tags(tags, coordinator, &uri, &new_name)
                    .map(|tags| (coordinator.to_string(), tags))
            }
            (None, _) => Err(CoreError::NoCoordinator),
            (_, None) => Err(CoreError::NoBunkerRecord),
        };
        let (coordinator, tags) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(uri = %uri, error = %e, "cannot rename bunker profile");
                self.emit(DataChange::PublishFailed {
                    kind: kinds::BUNKER_CONFIG,
                    error: e.to_string(),
                });
                reply(response_tx, Err(e.to_string()));
                return;
            }
        };

        if let Some(profile) = self.subscriptions.state.profile_mut(&uri) {
            profile.pending_name = new_name;
            profile.saving = true;
        }
        self.emit_bunker();

        let public_key = keys.public_key();
        let task_id = self.next_task();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let outcome = ctx
                .sign_and_broadcast(
                    task_id,
                    &keys,
                    kinds::BUNKER_CONFIG,
                    tags,
                    String::new(),
                    &[coordinator],
                )
                .await
                .map(|(event, relay)| (event, relay, Optimistic::BunkerConfig))
                .map_err(|e| e.to_string());

            let _ = ctx.task_tx.send(TaskDone::Published {
                task_id,
                identity_generation,
                public_key,
                kind: kinds::BUNKER_CONFIG,
                outcome,
                response_tx,
            });
        });
    }

    fn spawn_relay_list_fetch(&mut self, response_tx: Reply<Vec<RelayInfo>>) {
        let Some(public_key) = self.credentials.public_key() else {
            reply(response_tx, Err(CoreError::NotLoggedIn.to_string()));
            return;
        };
        let identity_generation = self.credentials.identity_generation();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let outcome = fetch_relay_list(
                ctx.transport.as_ref(),
                &ctx.index_relays,
                public_key,
                ctx.fetch_timeout,
            )
            .await
            .map(|fetched| fetched.map(|f| (f.value, f.created_at)))
            .map_err(|e| e.to_string());

            let _ = ctx.task_tx.send(TaskDone::RelayListFetched {
                identity_generation,
                public_key,
                outcome,
                response_tx,
            });
        });
    }

    fn spawn_profile_fetch(&mut self, response_tx: Reply<ProfileMetadata>) {
        let Some(public_key) = self.credentials.public_key() else {
            reply(response_tx, Err(CoreError::NotLoggedIn.to_string()));
            return;
        };
        let identity_generation = self.credentials.identity_generation();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let outcome = fetch_profile(
                ctx.transport.as_ref(),
                &ctx.index_relays,
                public_key,
                ctx.fetch_timeout,
            )
            .await
            .map(|fetched| fetched.map(|f| (f.value, f.created_at)))
            .map_err(|e| e.to_string());

            let _ = ctx.task_tx.send(TaskDone::ProfileFetched {
                identity_generation,
                public_key,
                outcome,
                response_tx,
            });
        });
    }

    /// Whether a task started under `identity_generation` for `public_key`
    /// may still touch state.
    fn is_current(&self, identity_generation: u64, public_key: &PublicKey) -> bool {
        identity_generation == self.credentials.identity_generation()
            && self.credentials.public_key().as_ref() == Some(public_key)
    }

    fn handle_task(&mut self, done: TaskDone) {
        match done {
            TaskDone::MiningStarted { task_id, cancel } => {
                self.mining.insert(task_id, cancel);
            }
            TaskDone::Published {
                task_id,
                identity_generation,
                public_key,
                kind,
                outcome,
                response_tx,
            } => {
                self.mining.remove(&task_id);
                self.finish_publish(identity_generation, public_key, kind, outcome, response_tx);
            }
            TaskDone::RelayListFetched {
                identity_generation,
                public_key,
                outcome,
                response_tx,
            } => {
                if !self.is_current(identity_generation, &public_key) {
                    tracing::debug!("dropping relay list fetched for a previous identity");
                    reply(response_tx, Err(CoreError::NotLoggedIn.to_string()));
                    return;
                }
                match outcome {
                    Ok(fetched) => {
                        if let Some((specs, created_at)) = fetched {
                            self.cache
                                .put_relay_list(public_key, specs, created_at, Origin::Remote);
                        }
                        let specs = self
                            .cache
                            .relay_list(&public_key)
                            .map(|v| v.value.clone())
                            .unwrap_or_default();
                        self.spawn_enrichment(public_key, identity_generation, specs, response_tx);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "relay list fetch failed");
                        reply(response_tx, Err(e));
                    }
                }
            }
            TaskDone::RelayListEnriched {
                identity_generation,
                public_key,
                specs,
                infos,
                response_tx,
            } => {
                if !self.is_current(identity_generation, &public_key) {
                    tracing::debug!(identity_generation, "dropping relay descriptors for a previous identity");
                    reply(response_tx, Err(CoreError::NotLoggedIn.to_string()));
                    return;
                }
                self.apply_descriptors(&public_key, &specs, infos);
                reply(response_tx, Ok(self.relay_infos.clone()));
            }
            TaskDone::ProfileFetched {
                identity_generation,
                public_key,
                outcome,
                response_tx,
            } => {
                if !self.is_current(identity_generation, &public_key) {
                    tracing::debug!("dropping profile fetched for a previous identity");
                    reply(response_tx, Err(CoreError::NotLoggedIn.to_string()));
                    return;
                }
                match outcome {
                    Ok(fetched) => {
                        if let Some((metadata, created_at)) = fetched {
                            self.cache
                                .put_profile(public_key, metadata, created_at, Origin::Remote);
                        }
                        let current = self
                            .cache
                            .profile(&public_key)
                            .map(|v| v.value.clone())
                            .unwrap_or_default();
                        self.emit(DataChange::Profile(current.clone()));
                        reply(response_tx, Ok(current));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "profile fetch failed");
                        reply(response_tx, Err(e));
                    }
                }
            }
        }
    }

    /// Show `specs` right away with the descriptors already known, then look
    /// the descriptors up off the control loop.
    fn spawn_enrichment(
        &mut self,
        public_key: PublicKey,
        identity_generation: u64,
        specs: Vec<RelaySpec>,
        response_tx: Reply<Vec<RelayInfo>>,
    ) {
        self.relay_infos = self.carry_descriptors(&specs);
        self.emit(DataChange::RelayList(self.relay_infos.clone()));

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let infos =
                enrich_relays(ctx.transport.as_ref(), specs.clone(), ctx.nip11_timeout).await;
            let _ = ctx.task_tx.send(TaskDone::RelayListEnriched {
                identity_generation,
                public_key,
                specs,
                infos,
                response_tx,
            });
        });
    }

    /// Fold looked-up descriptors into the current list. The list itself may
    /// have changed since the lookups started (an optimistic publish); only
    /// descriptors of relays still on it are taken.
    fn apply_descriptors(
        &mut self,
        public_key: &PublicKey,
        specs: &[RelaySpec],
        infos: Vec<RelayInfo>,
    ) {
        let unchanged = self
            .cache
            .relay_list(public_key)
            .map(|v| v.value.as_slice() == specs)
            .unwrap_or(specs.is_empty());
        if !unchanged {
            tracing::debug!("relay list changed during descriptor lookup, keeping the newer list");
        }

        let mut changed = false;
        for looked_up in infos {
            let Some(descriptor) = looked_up.descriptor else {
                continue;
            };
            for info in self
                .relay_infos
                .iter_mut()
                .filter(|i| i.spec.url == looked_up.spec.url)
            {
                if info.descriptor.as_ref() != Some(&descriptor) {
                    info.descriptor = Some(descriptor.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.emit(DataChange::RelayList(self.relay_infos.clone()));
        }
    }

    /// RelayInfos for `specs`, reusing descriptors and expansion state from
    /// the current list where the URL matches.
    fn carry_descriptors(&self, specs: &[RelaySpec]) -> Vec<RelayInfo> {
        specs
            .iter()
            .map(|spec| {
                let previous = self.relay_infos.iter().find(|i| i.spec.url == spec.url);
                let mut info = RelayInfo::new(spec.clone(), previous.and_then(|p| p.descriptor.clone()));
                info.expanded = previous.map(|p| p.expanded).unwrap_or(false);
                info
            })
            .collect()
    }

    fn finish_publish(
        &mut self,
        identity_generation: u64,
        public_key: PublicKey,
        kind: u16,
        outcome: Result<(Event, String, Optimistic), String>,
        response_tx: Reply<String>,
    ) {
        let (event, relay, optimistic) = match outcome {
            Ok(published) => published,
            Err(error) => {
                tracing::warn!(kind, error = %error, "publish failed");
                if kind == kinds::BUNKER_CONFIG && self.is_current(identity_generation, &public_key) {
                    if let Some(profiles) = self.subscriptions.state.profiles.as_mut() {
                        for profile in profiles.iter_mut().filter(|p| p.saving) {
                            profile.saving = false;
                        }
                    }
                    self.emit_bunker();
                }
                self.emit(DataChange::PublishFailed {
                    kind,
                    error: error.clone(),
                });
                reply(response_tx, Err(error));
                return;
            }
        };

        let event_id = event.id.to_hex();
        self.emit(DataChange::PublishSucceeded {
            kind,
            event_id: event_id.clone(),
            relay,
        });

        if !self.is_current(identity_generation, &public_key) {
            tracing::info!(kind, event_id = %event_id, "published for a previous identity, skipping local update");
            reply(response_tx, Ok(event_id));
            return;
        }

        match optimistic {
            Optimistic::Profile(metadata) => {
                if self
                    .cache
                    .put_profile(public_key, metadata, event.created_at, Origin::Local)
                {
                    if let Some(current) = self.cache.profile(&public_key) {
                        self.emit(DataChange::Profile(current.value.clone()));
                    }
                }
            }
            Optimistic::RelayList(specs) => {
                if self
                    .cache
                    .put_relay_list(public_key, specs.clone(), event.created_at, Origin::Local)
                {
                    self.relay_infos = self.carry_descriptors(&specs);
                    self.emit(DataChange::RelayList(self.relay_infos.clone()));
                }
            }
            Optimistic::BunkerConfig => {
                if self.subscriptions.ingest_local(&event) {
                    self.emit_bunker();
                }
            }
        }
        reply(response_tx, Ok(event_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::nip11::{RelayDescriptor, RelayLimitation};
    use crate::nostr::transport::{MockCall, MockTransport, SubscriptionMessage};
    use std::sync::mpsc::{self, Receiver};

    const COORD: &str = "wss://coordinator.example";
    const INDEX: &str = "wss://index.example";
    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        mock: MockTransport,
        command_tx: UnboundedSender<SyncCommand>,
        data_rx: Receiver<DataChange>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl Harness {
        fn new() -> Self {
            let mock = MockTransport::new();
            let config = CoreConfig {
                index_relays: vec![INDEX.to_string()],
                coordinators: vec![COORD.to_string()],
                pow_workers: 2,
                publish_timeout_secs: 2,
                nip11_timeout_secs: 1,
                fetch_timeout_secs: 1,
            };
            let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
            let (data_tx, data_rx) = mpsc::channel();
            let worker = SyncWorker::new(config, Arc::new(mock.clone()), data_tx, command_rx);
            let thread = std::thread::spawn(move || {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(worker.run());
            });
            Self {
                mock,
                command_tx,
                data_rx,
                thread: Some(thread),
            }
        }

        fn send(&self, command: SyncCommand) {
            self.command_tx.send(command).unwrap();
        }

        /// Wait for the first change matching `pred`, skipping the others.
        fn wait_for<T>(&self, mut pred: impl FnMut(DataChange) -> Option<T>) -> T {
            let deadline = std::time::Instant::now() + WAIT;
            loop {
                let left = deadline.saturating_duration_since(std::time::Instant::now());
                let change = self.data_rx.recv_timeout(left).expect("timed out waiting for change");
                if let Some(found) = pred(change) {
                    return found;
                }
            }
        }

        fn wait_until(&self, mut cond: impl FnMut() -> bool) {
            let deadline = std::time::Instant::now() + WAIT;
            while !cond() {
                assert!(std::time::Instant::now() < deadline, "condition not reached");
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        fn call<T>(&self, make: impl FnOnce(Reply<T>) -> SyncCommand) -> Result<T, String> {
            let (tx, rx) = mpsc::channel();
            self.send(make(Some(tx)));
            rx.recv_timeout(WAIT).expect("no reply")
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = self.command_tx.send(SyncCommand::Shutdown);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn bunker_event(keys: &Keys, tags: &[&[&str]]) -> Event {
        EventBuilder::new(Kind::from(kinds::BUNKER_CONFIG), "")
            .tags(tags.iter().map(|t| Tag::parse(t.iter().copied()).unwrap()))
            .sign_with_keys(keys)
            .unwrap()
    }

    #[test]
    fn test_login_subscribes_and_loads_profiles() {
        let h = Harness::new();
        let keys = Keys::generate();
        h.send(SyncCommand::Login { keys: keys.clone() });
        h.wait_until(|| h.mock.open_subscriptions() == 1);

        let event = bunker_event(&keys, &[&["h", "abc"], &["profile", "work", "sec1", "{}"]]);
        h.mock.emit_latest(SubscriptionMessage::Event(Box::new(event)));

        let profiles = h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) if !p.is_empty() => Some(p),
            _ => None,
        });
        assert_eq!(profiles[0].name, "work");
        assert!(profiles[0].uri().starts_with("bunker://abc?relay=wss%3A%2F%2Fcoordinator.example"));
    }

    #[test]
    fn test_eose_without_record_reports_empty_list() {
        let h = Harness::new();
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });
        h.wait_until(|| h.mock.open_subscriptions() == 1);
        h.mock.emit_latest(SubscriptionMessage::EndOfStoredEvents);

        let profiles = h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) => Some(p),
            _ => None,
        });
        assert!(profiles.is_empty());
    }

    #[test]
    fn test_switching_identity_closes_before_subscribing() {
        let h = Harness::new();
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });
        h.send(SyncCommand::SetCoordinator {
            url: "wss://other.example".to_string(),
        });
        h.wait_until(|| {
            h.mock
                .calls()
                .iter()
                .filter(|c| matches!(c, MockCall::Subscribe { .. }))
                .count()
                == 3
        });

        let mut open = 0i32;
        for call in h.mock.calls() {
            match call {
                MockCall::Subscribe { .. } => {
                    open += 1;
                    assert_eq!(open, 1, "two subscriptions open at once");
                }
                MockCall::Close { .. } => open -= 1,
                _ => {}
            }
        }
    }

    #[test]
    fn test_logout_closes_subscription_and_clears_profiles() {
        let h = Harness::new();
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });
        h.wait_until(|| h.mock.open_subscriptions() == 1);
        h.send(SyncCommand::Logout);
        h.wait_until(|| h.mock.open_subscriptions() == 0);
        h.wait_for(|c| match c {
            DataChange::BunkerProfiles(None) => Some(()),
            _ => None,
        });
    }

    #[test]
    fn test_publish_profile_merges_and_updates_cache() {
        let h = Harness::new();
        let keys = Keys::generate();
        let existing = EventBuilder::new(Kind::Metadata, r#"{"name":"A","about":"B","lud06":"x"}"#)
            .custom_created_at(Timestamp::from(1_000))
            .sign_with_keys(&keys)
            .unwrap();
        h.mock.store_event(INDEX, existing);
        h.send(SyncCommand::Login { keys: keys.clone() });
        h.wait_for(|c| match c {
            DataChange::Profile(p) if !p.is_empty() => Some(()),
            _ => None,
        });

        let event_id = h
            .call(|tx| SyncCommand::PublishProfile {
                fields: ProfileMetadata::from_pairs([("name", "C")]),
                response_tx: tx,
            })
            .unwrap();

        let published = h.mock.published();
        let (_, event) = published
            .iter()
            .find(|(_, e)| e.id.to_hex() == event_id)
            .unwrap();
        let content = ProfileMetadata::from_content(&event.content);
        assert_eq!(content.get("name"), Some("C"));
        assert_eq!(content.get("about"), Some("B"));
        assert_eq!(content.len(), 2);

        let profile = h.call(|tx| SyncCommand::RefreshProfile { response_tx: tx }).unwrap();
        assert_eq!(profile, content);
    }

    #[test]
    fn test_publish_fails_when_every_relay_rejects() {
        let h = Harness::new();
        h.mock.reject_relay(INDEX, "blocked");
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });

        let err = h
            .call(|tx| SyncCommand::PublishRelayList {
                relays: vec![RelaySpec::new(INDEX, true, false)],
                response_tx: tx,
            })
            .unwrap_err();
        assert!(err.contains("blocked"));

        // The cached list is unchanged: still empty after a refresh.
        let infos = h.call(|tx| SyncCommand::RefreshRelayList { response_tx: tx }).unwrap();
        assert!(infos.is_empty());
    }

    #[test]
    fn test_publish_relay_list_goes_to_write_relays_and_is_cached() {
        let h = Harness::new();
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });
        let relays = vec![
            RelaySpec::new("wss://mine.example", false, true),
            RelaySpec::new("wss://reader.example", true, false),
        ];
        h.call(|tx| SyncCommand::PublishRelayList {
            relays: relays.clone(),
            response_tx: tx,
        })
        .unwrap();
        h.wait_until(|| h.mock.published().len() == 2);

        let mut targets: Vec<String> = h.mock.published().into_iter().map(|(r, _)| r).collect();
        targets.sort();
        assert_eq!(targets, vec!["wss://index.example", "wss://mine.example"]);

        let infos = h.call(|tx| SyncCommand::RefreshRelayList { response_tx: tx }).unwrap();
        let specs: Vec<RelaySpec> = infos.into_iter().map(|i| i.spec).collect();
        assert_eq!(specs, relays);
    }

    #[test]
    fn test_publish_without_login_fails() {
        let h = Harness::new();
        let err = h
            .call(|tx| SyncCommand::PublishProfile {
                fields: ProfileMetadata::new(),
                response_tx: tx,
            })
            .unwrap_err();
        assert_eq!(err, CoreError::NotLoggedIn.to_string());
    }

    #[test]
    fn test_publish_mines_when_relay_demands_pow() {
        let h = Harness::new();
        h.mock.set_descriptor(
            INDEX,
            RelayDescriptor {
                limitation: Some(RelayLimitation {
                    min_pow_difficulty: Some(8),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        h.send(SyncCommand::Login {
            keys: Keys::generate(),
        });
        h.call(|tx| SyncCommand::PublishRelayList {
            relays: vec![],
            response_tx: tx,
        })
        .unwrap();

        let (_, event) = h.mock.published().pop().unwrap();
        assert!(crate::pow::leading_zero_bits(event.id.as_bytes()) >= 8);
        let progress: Vec<u8> = h
            .data_rx
            .try_iter()
            .filter_map(|c| match c {
                DataChange::PowProgress { best, target, .. } => {
                    assert_eq!(target, 8);
                    Some(best)
                }
                _ => None,
            })
            .collect();
        assert!(progress.iter().all(|b| *b <= 8));
    }

    #[test]
    fn test_rename_republishes_to_coordinator_only() {
        let h = Harness::new();
        let keys = Keys::generate();
        h.send(SyncCommand::Login { keys: keys.clone() });
        h.wait_until(|| h.mock.open_subscriptions() == 1);
        h.mock.emit_latest(SubscriptionMessage::Event(Box::new(bunker_event(
            &keys,
            &[&["h", "abc"], &["profile", "work", "sec1", ""], &["profile", "home", "sec2", ""]],
        ))));
        let profiles = h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) if p.len() == 2 => Some(p),
            _ => None,
        });

        h.call(|tx| SyncCommand::RenameBunkerProfile {
            uri: profiles[1].uri().to_string(),
            new_name: "house".to_string(),
            response_tx: tx,
        })
        .unwrap();

        let published = h.mock.published();
        let (relay, event) = published
            .iter()
            .find(|(_, e)| e.kind == Kind::from(kinds::BUNKER_CONFIG))
            .unwrap();
        assert_eq!(relay, COORD);
        let tags = crate::models::tag_utils::raw_tags(event);
        assert_eq!(tags[2], vec!["profile", "house", "sec2", ""]);

        let renamed = h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) if p.len() == 2 && p[1].name == "house" => Some(p),
            _ => None,
        });
        assert!(!renamed[1].saving);
    }

    #[test]
    fn test_set_profile_expanded_survives_refresh() {
        let h = Harness::new();
        let keys = Keys::generate();
        h.send(SyncCommand::Login { keys: keys.clone() });
        h.wait_until(|| h.mock.open_subscriptions() == 1);
        h.mock.emit_latest(SubscriptionMessage::Event(Box::new(bunker_event(
            &keys,
            &[&["h", "abc"], &["profile", "work", "sec1", ""]],
        ))));
        let uri = h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) if p.len() == 1 => Some(p[0].uri().to_string()),
            _ => None,
        });

        h.send(SyncCommand::SetProfileExpanded {
            uri: uri.clone(),
            expanded: true,
        });
        h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) if p.first().map(|p| p.expanded) == Some(true) => Some(()),
            _ => None,
        });

        h.mock.emit_latest(SubscriptionMessage::Event(Box::new(bunker_event(
            &keys,
            &[&["h", "abc"], &["profile", "work v2", "sec1", ""]],
        ))));
        let refreshed = h.wait_for(|c| match c {
            DataChange::BunkerProfiles(Some(p)) if p.first().map(|p| p.name.as_str()) == Some("work v2") => Some(p),
            _ => None,
        });
        assert!(refreshed[0].expanded);
        assert_eq!(refreshed[0].uri(), uri);
    }

    fn relay_list_event(keys: &Keys, urls: &[&str], created_at: u64) -> Event {
        EventBuilder::new(Kind::from(kinds::RELAY_LIST), "")
            .tags(urls.iter().map(|url| Tag::parse(["r", *url]).unwrap()))
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn named(name: &str) -> RelayDescriptor {
        RelayDescriptor {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn urls(infos: &[RelayInfo]) -> Vec<&str> {
        infos.iter().map(|i| i.spec.url.as_str()).collect()
    }

    #[test]
    fn test_late_descriptors_do_not_revert_published_relay_list() {
        let h = Harness::new();
        let keys = Keys::generate();
        let old = "wss://old.example";
        let new = "wss://new.example";
        h.mock.store_event(INDEX, relay_list_event(&keys, &[old], 1_000));
        h.mock.set_descriptor(old, named("Old"));
        h.mock.hold_descriptor(old);

        h.send(SyncCommand::Login { keys: keys.clone() });
        h.wait_for(|c| match c {
            DataChange::RelayList(infos) if urls(&infos) == [old] => Some(()),
            _ => None,
        });

        h.call(|tx| SyncCommand::PublishRelayList {
            relays: vec![RelaySpec::new(new, true, true)],
            response_tx: tx,
        })
        .unwrap();
        h.wait_for(|c| match c {
            DataChange::RelayList(infos) if urls(&infos) == [new] => Some(()),
            _ => None,
        });

        // Lookups for the superseded list finish now.
        h.mock.release_descriptor(old);
        let infos = h
            .call(|tx| SyncCommand::RefreshRelayList { response_tx: tx })
            .unwrap();
        assert_eq!(urls(&infos), [new]);

        for change in h.data_rx.try_iter() {
            if let DataChange::RelayList(infos) = change {
                assert_eq!(urls(&infos), [new]);
            }
        }
    }

    #[test]
    fn test_known_descriptors_survive_relay_list_publish() {
        let h = Harness::new();
        let keys = Keys::generate();
        let a = "wss://a.example";
        let b = "wss://b.example";
        h.mock.store_event(INDEX, relay_list_event(&keys, &[a], 1_000));
        h.mock.set_descriptor(a, named("A"));

        h.send(SyncCommand::Login { keys });
        h.wait_for(|c| match c {
            DataChange::RelayList(infos)
                if infos.first().and_then(|i| i.descriptor.as_ref()).is_some() =>
            {
                Some(())
            }
            _ => None,
        });

        h.call(|tx| SyncCommand::PublishRelayList {
            relays: vec![RelaySpec::new(a, true, true), RelaySpec::new(b, true, false)],
            response_tx: tx,
        })
        .unwrap();
        let published = h.wait_for(|c| match c {
            DataChange::RelayList(infos) if infos.len() == 2 => Some(infos),
            _ => None,
        });
        assert_eq!(
            published[0].descriptor.as_ref().and_then(|d| d.name.as_deref()),
            Some("A")
        );
        assert!(published[1].descriptor.is_none());
    }

    #[test]
    fn test_publish_completing_after_identity_switch_is_not_applied() {
        let h = Harness::new();
        let alice = Keys::generate();
        let bob = Keys::generate();
        let subscribes = |h: &Harness| {
            h.mock
                .calls()
                .iter()
                .filter(|c| matches!(c, MockCall::Subscribe { .. }))
                .count()
        };

        h.send(SyncCommand::Login {
            keys: alice.clone(),
        });
        h.wait_until(|| subscribes(&h) == 1);

        h.mock.hold_relay(INDEX);
        let (tx, rx) = mpsc::channel();
        h.send(SyncCommand::PublishProfile {
            fields: ProfileMetadata::from_pairs([("name", "alice")]),
            response_tx: Some(tx),
        });
        h.wait_until(|| {
            h.mock
                .calls()
                .iter()
                .any(|c| matches!(c, MockCall::Publish { .. }))
        });

        h.send(SyncCommand::Login { keys: bob.clone() });
        h.wait_until(|| subscribes(&h) == 2);
        h.mock.release_relay(INDEX);

        let event_id = rx.recv_timeout(WAIT).expect("no reply").unwrap();
        let published = h.mock.published();
        let (_, event) = published
            .iter()
            .find(|(_, e)| e.id.to_hex() == event_id)
            .unwrap();
        assert_eq!(event.pubkey, alice.public_key());

        let leaked = h.data_rx.try_iter().any(|c| {
            matches!(c, DataChange::Profile(p) if p.get("name") == Some("alice"))
        });
        assert!(!leaked);

        let profile = h
            .call(|tx| SyncCommand::RefreshProfile { response_tx: tx })
            .unwrap();
        assert_eq!(profile.get("name"), None);
    }
}
