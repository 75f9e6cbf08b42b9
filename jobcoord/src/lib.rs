// SPDX-License-Identifier: MIT
// jobcoord: keyed job coordinator
//
// - Serializes jobs that share a key, runs jobs of different keys in parallel.
// - Retries failed work, then rolls it back; a failed rollback is contained.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod config;
pub mod job_engine;

pub use crate::config::{EngineArgs, EngineConfig};
pub use crate::job_engine::async_op::{
    failed_op, op, ready_op, AsyncOp, OpFailure, OpOutput, OpResult, PendingOp,
};
pub use crate::job_engine::coordinator::JobCoordinator;
pub use crate::job_engine::job::{MainWorker, Phase, RollbackWorker, SuccessWorker};
pub use crate::job_engine::job_builder::{JobBuilder, JobSpec};
pub use crate::job_engine::stats::CoordinatorStats;
