// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_channel::{Receiver, Sender};
use async_io::Timer;
use futures::FutureExt;
use log::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::job_engine::async_op::panic_message;
use crate::job_engine::job::{JobRecord, MainWorker, RollbackWorker, SuccessWorker};
use crate::job_engine::job_builder::JobSpec;
use crate::job_engine::pipeline;
use crate::job_engine::shard_map::ShardMap;
use crate::job_engine::stats::{CoordinatorStats, Counters};
use crate::job_engine::worker_pool::WorkerPool;

/// State shared by the coordinator handle, the scheduler thread and the pipeline tasks.
#[derive(Debug)]
pub(crate) struct EngineShared {
    pub(crate) shards: ShardMap,
    pub(crate) pool: WorkerPool,
    pub(crate) stats: Counters,
    wake_tx: Sender<()>,
    progress: Mutex<()>,
    progress_cv: Condvar,
    next_seq: AtomicU64,
    stopped: AtomicBool,
}

impl EngineShared {
    /// Nudges the scheduler into another scan. Wake-ups coalesce.
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Tells drain waiters that a job cleared or a key queue was reclaimed.
    pub(crate) fn notify_progress(&self) {
        // taken so a waiter between its check and its wait cannot miss this
        drop(self.progress.lock().unwrap_or_else(PoisonError::into_inner));
        self.progress_cv.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Runs jobs so that jobs sharing a key execute one at a time, in submission
/// order, while jobs of different keys run in parallel on a shared worker pool.
#[derive(Debug)]
pub struct JobCoordinator {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    wake_rx: Receiver<()>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl JobCoordinator {
    /// Creates the shards and the worker pool. Nothing is dispatched before [`start`](Self::start).
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.worker_threads)?;
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        let shared = Arc::new(EngineShared {
            shards: ShardMap::new(config.shards),
            pool,
            stats: Counters::default(),
            wake_tx,
            progress: Mutex::new(()),
            progress_cv: Condvar::new(),
            next_seq: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });
        Ok(Self {
            config,
            shared,
            wake_rx,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the scheduler thread. Starting twice is a no-op.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.is_stopped() {
            bail!("the job coordinator has already been stopped");
        }
        if scheduler.is_some() {
            debug!("Scheduler loop already running");
            return Ok(());
        }

        let shared = self.shared.clone();
        let wake_rx = self.wake_rx.clone();
        let idle_backoff = self.config.idle_backoff;
        let handle = thread::Builder::new()
            .name("jobcoord-scheduler".to_string())
            .spawn(move || scheduler_loop(shared, wake_rx, idle_backoff))
            .context("failed to spawn the scheduler thread")?;
        *scheduler = Some(handle);

        info!(
            "Job coordinator started ({} shards, {} workers)",
            self.shared.shards.shard_count(),
            self.shared.pool.size()
        );
        Ok(())
    }

    /// Stops the scheduler and releases the worker pool. Jobs still in flight are
    /// abandoned. Calling it again is a no-op.
    pub fn stop(&self) {
        let mut scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_tx.close();
        if let Some(handle) = scheduler.take() {
            if handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
        self.shared.pool.shutdown();
        info!(
            "Job coordinator stopped, {} jobs abandoned",
            self.stats().outstanding()
        );
    }

    pub fn is_running(&self) -> bool {
        !self.shared.is_stopped()
            && self
                .scheduler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    /// Queues a job behind all jobs already submitted for `key`.
    ///
    /// Never fails and never blocks on running jobs. Outcomes are only observable
    /// through the side effects of the success and rollback workers.
    pub fn enqueue(
        &self,
        key: impl Into<String>,
        main: MainWorker,
        success: Option<SuccessWorker>,
        rollback: Option<RollbackWorker>,
        max_retries: u32,
    ) {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(JobRecord::new(
            seq,
            key.into(),
            main,
            success,
            rollback,
            max_retries,
        ));
        if self.shared.is_stopped() {
            warn!("{job} enqueued after the coordinator stopped, it will not run");
        }
        self.shared.stats.enqueued.inc();
        let waiting = self.shared.shards.enqueue(job.clone());
        debug!("Enqueued {job} ({waiting} waiting for the key)");
        self.shared.wake();
    }

    /// Queues a job assembled with a [`JobBuilder`](crate::job_engine::job_builder::JobBuilder).
    pub fn submit(&self, spec: JobSpec) {
        let JobSpec {
            key,
            main,
            success,
            rollback,
            max_retries,
        } = spec;
        self.enqueue(key, main, success, rollback, max_retries);
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.shared.stats.snapshot()
    }

    /// Number of keys that currently own a queue.
    pub fn key_count(&self) -> usize {
        self.shared.shards.key_count()
    }

    pub fn shard_for(&self, key: &str) -> usize {
        self.shared.shards.shard_for(key)
    }

    /// Blocks until every accepted job is cleared and every key queue has been
    /// reclaimed, or until `timeout` passes. Returns whether the engine went idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self
            .shared
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.stats().outstanding() == 0 && self.key_count() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            progress = self
                .shared
                .progress_cv
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scans all shards, hands the next job of every idle key to the pipeline and
/// drops empty key queues. Sleeps only after a scan that dispatched nothing.
fn scheduler_loop(shared: Arc<EngineShared>, wake_rx: Receiver<()>, idle_backoff: Duration) {
    info!("Scheduler loop started");
    while !shared.is_stopped() {
        let mut dispatched = 0;
        for index in 0..shared.shards.shard_count() {
            let scanned = panic::catch_unwind(AssertUnwindSafe(|| {
                let scan = shared.shards.scan(index);
                if scan.reclaimed > 0 {
                    debug!("Reclaimed {} idle keys in shard {index}", scan.reclaimed);
                    shared.notify_progress();
                }
                let started = scan.started.len();
                for job in scan.started {
                    pipeline::dispatch(&shared, job);
                }
                started
            }));
            match scanned {
                Ok(started) => dispatched += started,
                Err(payload) => error!(
                    "Scan of shard {index} failed: {}",
                    panic_message(&*payload)
                ),
            }
        }
        if dispatched == 0 && !wait_for_wakeup(&wake_rx, idle_backoff) {
            break;
        }
    }
    info!("Scheduler loop ended");
}

/// Returns false once the wake channel is closed.
fn wait_for_wakeup(wake_rx: &Receiver<()>, idle_backoff: Duration) -> bool {
    async_io::block_on(async {
        let woken = wake_rx.recv().fuse();
        let timer = Timer::after(idle_backoff).fuse();
        futures::pin_mut!(woken, timer);
        futures::select! {
            received = woken => received.is_ok(),
            _ = timer => true,
        }
    })
}
