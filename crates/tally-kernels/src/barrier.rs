//! The single Stage 1 / Stage 2 rendezvous.
//!
//! A worker that fails in Stage 1 still arrives, carrying its error, so the
//! group never deadlocks. After the rendezvous every worker sees whether
//! anyone failed and skips Stage 2 if so.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;

use parking_lot::Mutex;

use crate::error::EngineError;

pub struct StageBarrier {
    barrier: Barrier,
    participants: usize,
    failed: AtomicBool,
    first_failure: Mutex<Option<(usize, EngineError)>>,
}

impl StageBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            barrier: Barrier::new(participants),
            participants,
            failed: AtomicBool::new(false),
            first_failure: Mutex::new(None),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Record a failure. Only the first one is kept.
    pub fn fail(&self, worker: usize, err: EngineError) {
        tracing::debug!(worker, error = %err, "worker failed");
        let mut slot = self.first_failure.lock();
        if slot.is_none() {
            *slot = Some((worker, err));
        }
        self.failed.store(true, Ordering::Release);
    }

    /// Wait for every participant. Returns `true` when no worker has failed
    /// and Stage 2 may proceed.
    pub fn arrive(&self, worker: usize, outcome: Result<(), EngineError>) -> bool {
        if let Err(err) = outcome {
            self.fail(worker, err);
        }
        self.barrier.wait();
        !self.failed.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The first recorded failure and the worker that raised it.
    pub fn take_failure(&self) -> Option<(usize, EngineError)> {
        self.first_failure.lock().take()
    }
}
