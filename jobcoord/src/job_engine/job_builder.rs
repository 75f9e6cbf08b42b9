// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use crate::job_engine::async_op::{AsyncOp, OpOutput, PendingOp};
use crate::job_engine::coordinator::JobCoordinator;
use crate::job_engine::job::{MainWorker, RollbackWorker, SuccessWorker};

/// Everything `JobCoordinator::enqueue` needs, bundled.
pub struct JobSpec {
    pub(crate) key: String,
    pub(crate) main: MainWorker,
    pub(crate) success: Option<SuccessWorker>,
    pub(crate) rollback: Option<RollbackWorker>,
    pub(crate) max_retries: u32,
}

impl JobSpec {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("key", &self.key)
            .field("max_retries", &self.max_retries)
            .field("has_success", &self.success.is_some())
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

/// Fluent construction of a job from plain closures.
///
/// ```no_run
/// use jobcoord::{EngineConfig, JobBuilder, JobCoordinator, ready_op};
/// use serde_json::json;
///
/// let coordinator = JobCoordinator::new(EngineConfig::default()).unwrap();
/// coordinator.start().unwrap();
/// JobBuilder::new("openflow:1", || Ok(vec![ready_op(json!("flow added"))]))
///     .on_success(|outputs| {
///         println!("{} flows confirmed", outputs.len());
///         Ok(Vec::new())
///     })
///     .max_retries(3)
///     .enqueue(&coordinator);
/// ```
pub struct JobBuilder {
    spec: JobSpec,
}

impl JobBuilder {
    pub fn new<F>(key: impl Into<String>, main: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<AsyncOp>> + Send + Sync + 'static,
    {
        Self {
            spec: JobSpec {
                key: key.into(),
                main: Box::new(main),
                success: None,
                rollback: None,
                max_retries: 0,
            },
        }
    }

    pub fn on_success<F>(mut self, worker: F) -> Self
    where
        F: Fn(&[OpOutput]) -> anyhow::Result<Vec<AsyncOp>> + Send + Sync + 'static,
    {
        self.spec.success = Some(Box::new(worker));
        self
    }

    pub fn on_rollback<F>(mut self, worker: F) -> Self
    where
        F: Fn(&[PendingOp]) -> anyhow::Result<Vec<AsyncOp>> + Send + Sync + 'static,
    {
        self.spec.rollback = Some(Box::new(worker));
        self
    }

    /// Main attempts allowed before giving up; 0 and 1 both mean a single attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.spec.max_retries = max_retries;
        self
    }

    pub fn build(self) -> JobSpec {
        self.spec
    }

    pub fn enqueue(self, coordinator: &JobCoordinator) {
        coordinator.submit(self.build());
    }
}
