// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::future::Future;
use std::sync::{PoisonError, RwLock};

use anyhow::Context;
use futures::executor::ThreadPool;
use log::info;

/// Shared pool running every worker invocation, operation and completion.
#[derive(Debug)]
pub struct WorkerPool {
    pool: RwLock<Option<ThreadPool>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> anyhow::Result<Self> {
        let pool = ThreadPool::builder()
            .pool_size(size)
            .name_prefix("jobcoord-worker-")
            .create()
            .context("failed to start the worker pool")?;
        info!("Started worker pool with {size} threads");
        Ok(Self {
            pool: RwLock::new(Some(pool)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.handle().is_some()
    }

    fn handle(&self) -> Option<ThreadPool> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `task` on the pool. Returns false once the pool has been shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.handle() {
            Some(pool) => {
                pool.spawn_ok(task);
                true
            }
            None => false,
        }
    }

    /// Releases the pool. Threads exit once the tasks they are polling return.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            info!("Worker pool released");
        }
    }
}
