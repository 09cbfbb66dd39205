//! One nonce-search worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::hash::{leading_zero_bits, EventIdBytes, NonceHasher, UnsignedRecord};

/// How many nonces a worker tries between checks of the cancel flag
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Work assignment: nonces `start, start + stride, start + 2 * stride, ...`
#[derive(Debug, Clone)]
pub struct MineRequest {
    pub record: Arc<UnsignedRecord>,
    pub difficulty: u8,
    pub start: u64,
    pub stride: u64,
}

#[derive(Debug, Clone)]
pub enum MineReport {
    /// A hash better than anything this worker found before.
    Progress { worker: u64, achieved: u8 },
    /// A qualifying record, nonce tag included.
    Completed {
        worker: u64,
        record: UnsignedRecord,
        id: EventIdBytes,
    },
}

/// Search until a qualifying nonce is found, the nonce space of this worker is
/// exhausted, `cancel` is raised or nobody listens to reports anymore.
pub fn run(request: MineRequest, reports: Sender<MineReport>, cancel: Arc<AtomicBool>) {
    let worker = request.start;
    let hasher = NonceHasher::new(&request.record, request.difficulty);
    let mut best: u8 = 0;
    let mut nonce = request.start;
    let mut tried: u64 = 0;

    loop {
        if tried % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            tracing::trace!(worker, tried, "pow worker cancelled");
            return;
        }

        let id = hasher.hash(nonce);
        let achieved = leading_zero_bits(&id);

        if achieved >= request.difficulty {
            tracing::debug!(worker, nonce, achieved, tried, "pow worker found nonce");
            let _ = reports.send(MineReport::Completed {
                worker,
                record: request.record.with_nonce(nonce, request.difficulty),
                id,
            });
            return;
        }

        if achieved > best {
            best = achieved;
            if reports.send(MineReport::Progress { worker, achieved }).is_err() {
                return;
            }
        }

        tried += 1;
        nonce = match nonce.checked_add(request.stride) {
            Some(next) => next,
            None => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::*;
    use std::sync::mpsc;

    fn request(difficulty: u8, start: u64, stride: u64) -> MineRequest {
        let keys = Keys::generate();
        MineRequest {
            record: Arc::new(UnsignedRecord::new(
                &keys.public_key(),
                1,
                vec![],
                "mine me",
                Timestamp::from(1_700_000_000),
            )),
            difficulty,
            start,
            stride,
        }
    }

    #[test]
    fn test_worker_progress_is_strictly_increasing_then_completes() {
        let (tx, rx) = mpsc::channel();
        run(request(8, 0, 1), tx, Arc::new(AtomicBool::new(false)));

        let reports: Vec<_> = rx.iter().collect();
        let mut last = 0;
        for report in &reports[..reports.len() - 1] {
            match report {
                MineReport::Progress { achieved, .. } => {
                    assert!(*achieved > last);
                    assert!(*achieved < 8);
                    last = *achieved;
                }
                MineReport::Completed { .. } => panic!("completed before the end"),
            }
        }
        match reports.last().unwrap() {
            MineReport::Completed { record, id, .. } => {
                assert!(leading_zero_bits(id) >= 8);
                assert_eq!(&record.compute_id(), id);
            }
            other => panic!("unexpected final report {:?}", other),
        }
    }

    #[test]
    fn test_worker_stays_in_its_residue_class() {
        let (tx, rx) = mpsc::channel();
        run(request(6, 3, 4), tx, Arc::new(AtomicBool::new(false)));

        let nonce = rx
            .iter()
            .find_map(|r| match r {
                MineReport::Completed { record, .. } => record.nonce(),
                _ => None,
            })
            .unwrap();
        assert_eq!(nonce % 4, 3);
    }

    #[test]
    fn test_cancelled_worker_stops_without_completing() {
        let (tx, rx) = mpsc::channel();
        run(request(200, 0, 1), tx, Arc::new(AtomicBool::new(true)));
        assert!(rx
            .iter()
            .all(|r| !matches!(r, MineReport::Completed { .. })));
    }
}
