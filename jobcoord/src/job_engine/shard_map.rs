// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::job_engine::job::JobRecord;
use crate::job_engine::key_queue::KeyQueue;

/// FNV-1a 64-bit hash, stable across processes and runs.
#[inline]
pub fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

type Shard = Mutex<HashMap<String, KeyQueue>>;

/// Result of scanning one shard.
#[derive(Debug, Default)]
pub struct ShardScan {
    /// Jobs that were moved into execution and must be handed to the pipeline.
    pub started: Vec<Arc<JobRecord>>,
    /// Number of key queues dropped because they had nothing left to do.
    pub reclaimed: usize,
}

/// Fixed number of independently locked key -> queue maps.
#[derive(Debug)]
pub struct ShardMap {
    shards: Vec<Shard>,
}

impl ShardMap {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: &str) -> usize {
        (fnv1a64(key.as_bytes()) % self.shards.len() as u64) as usize
    }

    // a panicking lock holder must not wedge the shard for everybody else
    fn lock(&self, index: usize) -> MutexGuard<'_, HashMap<String, KeyQueue>> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `job` to its key queue, creating the queue on first use.
    /// Returns the number of jobs now waiting for that key.
    pub fn enqueue(&self, job: Arc<JobRecord>) -> usize {
        let mut shard = self.lock(self.shard_for(job.key()));
        let queue = shard.entry(job.key().to_string()).or_default();
        queue.push(job);
        queue.waiting_len()
    }

    /// Releases the execution slot held by `job`.
    pub fn finish(&self, job: &JobRecord) -> bool {
        let mut shard = self.lock(self.shard_for(job.key()));
        shard
            .get_mut(job.key())
            .map(|queue| queue.finish(job.seq()))
            .unwrap_or(false)
    }

    /// Starts the next job of every idle key in shard `index` and drops key
    /// queues that are idle and have nothing waiting.
    pub fn scan(&self, index: usize) -> ShardScan {
        let mut scan = ShardScan::default();
        let mut shard = self.lock(index);
        shard.retain(|_, queue| {
            if let Some(job) = queue.start_next() {
                scan.started.push(job);
                true
            } else if queue.is_empty() {
                scan.reclaimed += 1;
                false
            } else {
                true
            }
        });
        scan
    }

    /// Number of live key queues across all shards.
    pub fn key_count(&self) -> usize {
        (0..self.shards.len()).map(|i| self.lock(i).len()).sum()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock(self.shard_for(key)).contains_key(key)
    }
}
