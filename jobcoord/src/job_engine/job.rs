// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::job_engine::async_op::{AsyncOp, OpOutput, PendingOp};

/// Produces the operations of the main work. Invoked once per attempt.
pub type MainWorker = Box<dyn Fn() -> anyhow::Result<Vec<AsyncOp>> + Send + Sync + 'static>;

/// Continuation after the main work succeeded; receives the outputs of its operations.
pub type SuccessWorker =
    Box<dyn Fn(&[OpOutput]) -> anyhow::Result<Vec<AsyncOp>> + Send + Sync + 'static>;

/// Compensation after the retries are exhausted; receives the failed attempt's operations.
pub type RollbackWorker =
    Box<dyn Fn(&[PendingOp]) -> anyhow::Result<Vec<AsyncOp>> + Send + Sync + 'static>;

/// Which worker of a job produced the operations currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Main,
    Success,
    /// Entered at most once. A failure in this phase is a double fault.
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Main => write!(f, "main"),
            Phase::Success => write!(f, "success"),
            Phase::Rollback => write!(f, "rollback"),
        }
    }
}

/// A job as held by its key queue and the execution pipeline.
pub struct JobRecord {
    seq: u64,
    key: String,
    main: MainWorker,
    success: Option<SuccessWorker>,
    rollback: Option<RollbackWorker>,
    retries_remaining: AtomicI64,
    phase: Mutex<Phase>,
    pending: Mutex<Vec<PendingOp>>,
}

impl JobRecord {
    pub fn new(
        seq: u64,
        key: String,
        main: MainWorker,
        success: Option<SuccessWorker>,
        rollback: Option<RollbackWorker>,
        max_retries: u32,
    ) -> Self {
        Self {
            seq,
            key,
            main,
            success,
            rollback,
            retries_remaining: AtomicI64::new(i64::from(max_retries)),
            phase: Mutex::new(Phase::Main),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Engine-wide submission sequence number, used in logs.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn main_worker(&self) -> &MainWorker {
        &self.main
    }

    pub fn success_worker(&self) -> Option<&SuccessWorker> {
        self.success.as_ref()
    }

    pub fn rollback_worker(&self) -> Option<&RollbackWorker> {
        self.rollback.as_ref()
    }

    pub fn retries_remaining(&self) -> i64 {
        self.retries_remaining.load(Ordering::SeqCst)
    }

    /// Consumes one retry and returns how many are left afterwards.
    pub fn decrement_retries(&self) -> i64 {
        self.retries_remaining.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// Operations of the most recent attempt.
    pub fn pending_ops(&self) -> Vec<PendingOp> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_pending_ops(&self, ops: Vec<PendingOp>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = ops;
    }
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("seq", &self.seq)
            .field("key", &self.key)
            .field("phase", &self.phase())
            .field("retries_remaining", &self.retries_remaining())
            .field("has_success", &self.success.is_some())
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job #{} [{}]", self.seq, self.key)
    }
}
