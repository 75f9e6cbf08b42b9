// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::bail;
use clap::Args;

/// Sizing and pacing of a `JobCoordinator` instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of independently locked key partitions.
    pub shards: usize,
    /// Threads in the worker pool running workers, operations and completions.
    pub worker_threads: usize,
    /// How long the scheduler sleeps after a scan that dispatched nothing.
    pub idle_backoff: Duration,
}

pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_secs(1);

fn hardware_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = hardware_parallelism();
        Self {
            shards: parallelism,
            worker_threads: parallelism,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }
}

impl EngineConfig {
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shards == 0 {
            bail!("the number of shards must be at least 1");
        }
        if self.worker_threads == 0 {
            bail!("the worker pool needs at least 1 thread");
        }
        if self.idle_backoff.is_zero() {
            bail!("the idle backoff must be longer than zero");
        }
        Ok(())
    }
}

/// Command line flags that map onto an [`EngineConfig`].
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Number of key shards (defaults to the available hardware parallelism)
    #[arg(long)]
    pub shards: Option<usize>,

    /// Worker pool size (defaults to the available hardware parallelism)
    #[arg(long = "worker-threads")]
    pub worker_threads: Option<usize>,

    /// Scheduler sleep in milliseconds when a scan found nothing to dispatch
    #[arg(long = "idle-backoff-ms", default_value_t = 1000)]
    pub idle_backoff_ms: u64,
}

impl EngineArgs {
    pub fn to_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config =
            EngineConfig::default().with_idle_backoff(Duration::from_millis(self.idle_backoff_ms));
        if let Some(shards) = self.shards {
            config = config.with_shards(shards);
        }
        if let Some(worker_threads) = self.worker_threads {
            config = config.with_worker_threads(worker_threads);
        }
        config.validate()?;
        Ok(config)
    }
}
