// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Keyed Job Coordinator
//!
//! ## Overview
//! Jobs are submitted under a string key. Jobs sharing a key run one at a time in
//! submission order, jobs of different keys run in parallel.
//!
//! - Keys are routed to a fixed number of shards by hash; each shard is a mutex
//!   around a key -> queue map, so submitters only contend within a shard.
//! - Each key queue is an unbounded FIFO plus at most one executing job.
//! - A single scheduler thread scans the shards, starts the next job of every idle
//!   key and drops queues that ran dry. It sleeps when a scan found nothing to do
//!   and is woken by enqueues and finished jobs.
//! - Jobs execute on a shared worker pool sized to the hardware: the main worker
//!   returns async operations, the completion of all of them decides between the
//!   success continuation, a retry, or the rollback. A failing rollback is a double
//!   fault and ends the job.
//!
//! ```text
//!         +-----------+   enqueue    +------------------------------+
//!         |  callers  | -----------> | shard 0 | shard 1 | shard .. |
//!         +-----------+              +----+---------+---------+----+
//!                                         |  scan   |         |
//!                                    +----v---------v---------v----+
//!                                    |       scheduler thread       |
//!                                    +--------------+---------------+
//!                                                   | dispatch
//!                                    +--------------v---------------+
//!                                    |  worker pool: main -> success |
//!                                    |   | retry | rollback -> clear |
//!                                    +------------------------------+
//! ```

pub mod async_op;
pub mod coordinator;
pub mod job;
pub mod job_builder;
pub mod key_queue;
mod pipeline;
pub mod shard_map;
pub mod stats;
pub mod worker_pool;

#[cfg(test)]
mod tests;
