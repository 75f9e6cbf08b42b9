// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Execution of a single job: main work, then the success continuation, or
//! retries followed by the rollback. Every step runs as its own task on the
//! worker pool and continues from the completion of the operations it launched.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, error, info, warn};

use crate::job_engine::async_op::{self, panic_message, AsyncOp, OpFailure, OpOutput};
use crate::job_engine::coordinator::EngineShared;
use crate::job_engine::job::{JobRecord, Phase};

enum Step {
    Main,
    Success(Vec<OpOutput>),
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Succeeded,
    RolledBack,
    Exhausted,
    DoubleFault,
    RollbackError,
}

impl Finish {
    /// Outcome of a step that launched no operations.
    fn after_uneventful(phase: Phase, worker_failed: bool) -> Self {
        match phase {
            Phase::Main | Phase::Success => Finish::Succeeded,
            Phase::Rollback if worker_failed => Finish::RollbackError,
            Phase::Rollback => Finish::RolledBack,
        }
    }
}

/// Starts a job that its key queue just moved into execution.
pub(crate) fn dispatch(shared: &Arc<EngineShared>, job: Arc<JobRecord>) {
    shared.stats.dispatched.inc();
    debug!("Dispatching {job}");
    submit(shared, job, Step::Main);
}

fn submit(shared: &Arc<EngineShared>, job: Arc<JobRecord>, step: Step) {
    let desc = job.to_string();
    if !shared.pool.spawn(run_step(shared.clone(), job, step)) {
        warn!("Worker pool is gone, abandoning {desc}");
    }
}

fn invoke(job: &JobRecord, step: &Step) -> anyhow::Result<Vec<AsyncOp>> {
    let call = || match step {
        Step::Main => (job.main_worker())(),
        Step::Success(outputs) => match job.success_worker() {
            Some(worker) => worker(outputs),
            None => Ok(Vec::new()),
        },
        Step::Rollback => match job.rollback_worker() {
            Some(worker) => worker(&job.pending_ops()),
            None => Ok(Vec::new()),
        },
    };
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(produced) => produced,
        Err(payload) => Err(anyhow!("worker panicked: {}", panic_message(&*payload))),
    }
}

async fn run_step(shared: Arc<EngineShared>, job: Arc<JobRecord>, step: Step) {
    let phase = job.phase();
    let (ops, worker_failed) = match invoke(&job, &step) {
        Ok(ops) => (ops, false),
        Err(e) => {
            shared.stats.worker_errors.inc();
            warn!("{phase} worker of {job} failed: {e:#}");
            (Vec::new(), true)
        }
    };

    if ops.is_empty() {
        debug!("{phase} worker of {job} produced no operations");
        finish(&shared, &job, Finish::after_uneventful(phase, worker_failed));
        return;
    }

    let Some(pending) = async_op::launch(&shared.pool, ops) else {
        warn!("Worker pool is gone, abandoning {job}");
        return;
    };
    debug!("{job} is waiting for {} {phase} operations", pending.len());
    job.set_pending_ops(pending.clone());

    let outcome = async_op::all_succeed(pending).await;
    on_complete(&shared, job, outcome);
}

fn on_complete(
    shared: &Arc<EngineShared>,
    job: Arc<JobRecord>,
    outcome: Result<Vec<OpOutput>, OpFailure>,
) {
    let phase = job.phase();
    match (outcome, phase) {
        (Ok(outputs), Phase::Main) => {
            if job.success_worker().is_some() {
                debug!("Main work of {job} succeeded, running the success worker");
                job.set_phase(Phase::Success);
                submit(shared, job, Step::Success(outputs));
            } else {
                finish(shared, &job, Finish::Succeeded);
            }
        }
        (Ok(_), Phase::Success) => finish(shared, &job, Finish::Succeeded),
        (Ok(_), Phase::Rollback) => finish(shared, &job, Finish::RolledBack),
        (Err(failure), Phase::Rollback) => {
            error!("Double fault: rollback of {job} failed ({failure}), giving up on the job");
            finish(shared, &job, Finish::DoubleFault);
        }
        (Err(failure), Phase::Main | Phase::Success) => {
            let retries_left = job.decrement_retries();
            if retries_left > 0 {
                shared.stats.retried.inc();
                debug!("{phase} work of {job} failed ({failure}), retrying ({retries_left} retries left)");
                job.set_phase(Phase::Main);
                submit(shared, job, Step::Main);
            } else if job.rollback_worker().is_some() {
                info!("{phase} work of {job} failed ({failure}) and retries are exhausted, rolling back");
                job.set_phase(Phase::Rollback);
                submit(shared, job, Step::Rollback);
            } else {
                warn!("{phase} work of {job} failed ({failure}) and retries are exhausted, dropping the job");
                finish(shared, &job, Finish::Exhausted);
            }
        }
    }
}

/// Terminal state: releases the key for its next job and wakes the scheduler.
fn finish(shared: &EngineShared, job: &JobRecord, how: Finish) {
    match how {
        Finish::Succeeded => shared.stats.succeeded.inc(),
        Finish::RolledBack => shared.stats.rolled_back.inc(),
        Finish::Exhausted => shared.stats.exhausted.inc(),
        Finish::DoubleFault => shared.stats.double_faults.inc(),
        Finish::RollbackError => shared.stats.rollback_errors.inc(),
    }
    if !shared.shards.finish(job) {
        error!("{job} finished without holding the execution slot of its key");
    }
    shared.stats.cleared.inc();
    debug!("{job} cleared ({how:?})");
    shared.wake();
    shared.notify_progress();
}
