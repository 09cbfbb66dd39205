use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self as tokio_mpsc, UnboundedSender};

use crate::config::CoreConfig;
use crate::nostr::transport::{NostrSdkTransport, RelayTransport};
use crate::nostr::{DataChange, SyncCommand, SyncWorker};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct CoreHandle {
    command_tx: UnboundedSender<SyncCommand>,
}

impl CoreHandle {
    pub fn send(
        &self,
        command: SyncCommand,
    ) -> Result<(), tokio_mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(command)
    }
}

/// Owns the sync worker thread and the channels to talk to it.
pub struct CoreRuntime {
    data_rx: Option<Receiver<DataChange>>,
    handle: CoreHandle,
    worker_handle: Option<JoinHandle<()>>,
}

impl CoreRuntime {
    /// Start the engine against live relays.
    pub fn new(config: CoreConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(NostrSdkTransport::new()))
    }

    pub fn with_transport(config: CoreConfig, transport: Arc<dyn RelayTransport>) -> Result<Self> {
        config.validate()?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("signet-io")
            .build()
            .context("Failed to create tokio runtime")?;

        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel::<SyncCommand>();
        let (data_tx, data_rx) = mpsc::channel::<DataChange>();

        let worker = SyncWorker::new(config, transport, data_tx, command_rx);
        let worker_handle = std::thread::Builder::new()
            .name("signet-sync".to_string())
            .spawn(move || {
                rt.block_on(worker.run());
                // Do not hang on blocking tasks (pow jobs) that outlived the loop.
                rt.shutdown_timeout(SHUTDOWN_GRACE);
                tracing::debug!("sync worker thread exiting");
            })
            .context("Failed to spawn sync worker thread")?;

        Ok(Self {
            data_rx: Some(data_rx),
            handle: CoreHandle { command_tx },
            worker_handle: Some(worker_handle),
        })
    }

    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    pub fn take_data_rx(&mut self) -> Option<Receiver<DataChange>> {
        self.data_rx.take()
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.send(SyncCommand::Shutdown);
        if let Some(worker_handle) = self.worker_handle.take() {
            if worker_handle.join().is_err() {
                tracing::error!("sync worker thread panicked");
            }
        }
    }
}

impl Drop for CoreRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
