// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::sync::Arc;

use crate::job_engine::job::JobRecord;

/// Jobs of a single key: a FIFO of waiting jobs and at most one executing job.
#[derive(Debug, Default)]
pub struct KeyQueue {
    waiting: VecDeque<Arc<JobRecord>>,
    executing: Option<Arc<JobRecord>>,
}

impl KeyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Arc<JobRecord>) {
        self.waiting.push_back(job);
    }

    pub fn is_idle(&self) -> bool {
        self.executing.is_none()
    }

    /// Idle with nothing waiting; such a queue may be dropped from its shard.
    pub fn is_empty(&self) -> bool {
        self.is_idle() && self.waiting.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn executing(&self) -> Option<&Arc<JobRecord>> {
        self.executing.as_ref()
    }

    /// Moves the oldest waiting job into execution, unless one is already running.
    pub fn start_next(&mut self) -> Option<Arc<JobRecord>> {
        if !self.is_idle() {
            return None;
        }
        let job = self.waiting.pop_front()?;
        self.executing = Some(job.clone());
        Some(job)
    }

    /// Releases the execution slot if `seq` is the job holding it.
    pub fn finish(&mut self, seq: u64) -> bool {
        match &self.executing {
            Some(job) if job.seq() == seq => {
                self.executing = None;
                true
            }
            _ => false,
        }
    }
}
