// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) enqueued: Counter,
    pub(crate) dispatched: Counter,
    pub(crate) retried: Counter,
    pub(crate) succeeded: Counter,
    pub(crate) rolled_back: Counter,
    pub(crate) exhausted: Counter,
    pub(crate) double_faults: Counter,
    pub(crate) rollback_errors: Counter,
    pub(crate) worker_errors: Counter,
    pub(crate) cleared: Counter,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> CoordinatorStats {
        // cleared first, so outstanding() never underflows against a racing enqueue
        let cleared = self.cleared.get();
        CoordinatorStats {
            enqueued: self.enqueued.get(),
            dispatched: self.dispatched.get(),
            retried: self.retried.get(),
            succeeded: self.succeeded.get(),
            rolled_back: self.rolled_back.get(),
            exhausted: self.exhausted.get(),
            double_faults: self.double_faults.get(),
            rollback_errors: self.rollback_errors.get(),
            worker_errors: self.worker_errors.get(),
            cleared,
        }
    }
}

/// Point-in-time view of the coordinator's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Jobs accepted by `enqueue`.
    pub enqueued: u64,
    /// Jobs handed from their key queue to the worker pool.
    pub dispatched: u64,
    /// Main worker re-invocations after a failed attempt.
    pub retried: u64,
    /// Jobs cleared after their main (and success) work completed.
    pub succeeded: u64,
    /// Jobs cleared after the operations of their rollback worker completed.
    pub rolled_back: u64,
    /// Jobs cleared after running out of retries with no rollback worker.
    pub exhausted: u64,
    /// Jobs whose rollback failed.
    pub double_faults: u64,
    /// Jobs cleared because their rollback worker itself errored or panicked.
    pub rollback_errors: u64,
    /// Worker invocations that returned an error or panicked.
    pub worker_errors: u64,
    pub cleared: u64,
}

impl CoordinatorStats {
    /// Jobs accepted but not yet cleared.
    pub fn outstanding(&self) -> u64 {
        self.enqueued.saturating_sub(self.cleared)
    }
}
