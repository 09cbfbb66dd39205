//! Parallel proof-of-work (NIP-13) nonce search.
//!
//! [`PowMiner::start`] splits the nonce space into `workers` residue classes
//! and runs one OS thread per class. The returned [`PowJob`] fans the worker
//! reports into a single monotonic progress value and resolves on the first
//! qualifying record. Every worker is stopped and joined from one place,
//! [`PowJob::finish`], whether the job succeeded, was cancelled or dropped.

pub mod hash;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use nostr_sdk::prelude::*;

pub use hash::{leading_zero_bits, EventIdBytes, UnsignedRecord};
use worker::{MineReport, MineRequest};

use crate::models::tag_utils::build_tags;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowError {
    #[error("proof-of-work cancelled")]
    Cancelled,

    #[error("Failed to spawn pow worker: {0}")]
    Spawn(String),

    #[error("Failed to sign mined event: {0}")]
    Signing(String),

    /// The signed event hashed to a different id than the one mined.
    #[error("mined id {mined} does not match signed id {signed}")]
    IdMismatch { mined: String, signed: String },
}

/// A record whose id meets the requested difficulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedRecord {
    pub record: UnsignedRecord,
    pub id: EventIdBytes,
}

impl MinedRecord {
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn difficulty(&self) -> u8 {
        leading_zero_bits(&self.id)
    }

    /// Sign with `keys`, which must own `record.pubkey`.
    pub fn sign(&self, keys: &Keys) -> Result<Event, PowError> {
        let tags = build_tags(&self.record.tags).map_err(|e| PowError::Signing(e.to_string()))?;
        let event = EventBuilder::new(Kind::from(self.record.kind), self.record.content.clone())
            .tags(tags)
            .custom_created_at(Timestamp::from(self.record.created_at))
            .sign_with_keys(keys)
            .map_err(|e| PowError::Signing(e.to_string()))?;

        let signed = event.id.to_hex();
        let mined = self.id_hex();
        if signed != mined {
            return Err(PowError::IdMismatch { mined, signed });
        }
        Ok(event)
    }
}

/// Cancels a running [`PowJob`] from another thread or task.
#[derive(Debug, Clone)]
pub struct PowCancel(Arc<AtomicBool>);

impl PowCancel {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PowMiner {
    workers: usize,
}

impl PowMiner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start mining. A difficulty of zero resolves immediately with the record
    /// unchanged and spawns nothing.
    pub fn start(&self, record: UnsignedRecord, difficulty: u8) -> Result<PowJob, PowError> {
        let cancel = Arc::new(AtomicBool::new(false));

        if difficulty == 0 {
            let id = record.compute_id();
            return Ok(PowJob {
                difficulty,
                best: 0,
                reports: None,
                ready: Some(MinedRecord { record, id }),
                cancel,
                handles: Vec::new(),
            });
        }

        let (tx, rx) = mpsc::channel();
        let record = Arc::new(record);
        let stride = self.workers as u64;
        let mut job = PowJob {
            difficulty,
            best: 0,
            reports: Some(rx),
            ready: None,
            cancel: cancel.clone(),
            handles: Vec::with_capacity(self.workers),
        };

        for start in 0..stride {
            let request = MineRequest {
                record: record.clone(),
                difficulty,
                start,
                stride,
            };
            let reports = tx.clone();
            let cancel = cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("pow-worker-{}", start))
                .spawn(move || worker::run(request, reports, cancel))
                .map_err(|e| PowError::Spawn(e.to_string()))?;
            job.handles.push(handle);
        }

        tracing::debug!(difficulty, workers = self.workers, "pow job started");
        Ok(job)
    }

    /// Mine to completion on the calling thread.
    pub fn mine(
        &self,
        record: UnsignedRecord,
        difficulty: u8,
        on_better: impl FnMut(u8),
    ) -> Result<MinedRecord, PowError> {
        self.start(record, difficulty)?.wait(on_better)
    }
}

/// A running nonce search.
pub struct PowJob {
    difficulty: u8,
    /// Best difficulty reported so far, capped at `difficulty`
    best: u8,
    reports: Option<Receiver<MineReport>>,
    ready: Option<MinedRecord>,
    cancel: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl PowJob {
    pub fn canceller(&self) -> PowCancel {
        PowCancel(self.cancel.clone())
    }

    pub fn best(&self) -> u8 {
        self.best
    }

    /// Block until a worker finds a qualifying record or the job is cancelled.
    /// `on_better` sees every increase of the best difficulty, never a value
    /// above the target.
    pub fn wait(mut self, mut on_better: impl FnMut(u8)) -> Result<MinedRecord, PowError> {
        if let Some(mined) = self.ready.take() {
            return Ok(mined);
        }

        let result = self.collect(&mut on_better);
        self.finish();
        result
    }

    fn collect(&mut self, on_better: &mut impl FnMut(u8)) -> Result<MinedRecord, PowError> {
        let reports = match self.reports.take() {
            Some(rx) => rx,
            None => return Err(PowError::Cancelled),
        };

        // The receiver is only disconnected once every worker has exited.
        for report in reports.iter() {
            match report {
                MineReport::Progress { achieved, .. } => {
                    let capped = achieved.min(self.difficulty);
                    if capped > self.best {
                        self.best = capped;
                        on_better(capped);
                    }
                }
                MineReport::Completed { worker, record, id } => {
                    tracing::debug!(worker, id = %hex::encode(id), "pow job completed");
                    if self.difficulty > self.best {
                        self.best = self.difficulty;
                        on_better(self.difficulty);
                    }
                    return Ok(MinedRecord { record, id });
                }
            }
        }
        Err(PowError::Cancelled)
    }

    /// Stop and join every worker.
    fn finish(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.reports = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("pow worker panicked");
            }
        }
    }
}

impl Drop for PowJob {
    fn drop(&mut self) {
        self.finish();
    }
}
