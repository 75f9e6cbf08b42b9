// SPDX-License-Identifier: MIT
// jobcoord: soak test for the keyed job coordinator
//
// - Submits a synthetic workload of jobs over a number of keys.
// - Operations fail on a fixed cadence to exercise retries and rollbacks.
// - Prints the coordinator statistics as JSON once everything drained.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_io::Timer;
use clap::Parser;
use jobcoord::{op, ready_op, CoordinatorStats, EngineArgs, JobBuilder, JobCoordinator};
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Number of distinct job keys
    #[arg(long, default_value_t = 8)]
    keys: usize,

    /// Jobs submitted per key
    #[arg(long = "jobs-per-key", default_value_t = 16)]
    jobs_per_key: usize,

    /// Main attempts per job before the rollback runs
    #[arg(long = "max-retries", default_value_t = 2)]
    max_retries: u32,

    /// Fail every n-th operation (0 disables failures)
    #[arg(long = "fail-every", default_value_t = 0)]
    fail_every: u64,

    /// Simulated latency of a single operation
    #[arg(long = "latency-ms", default_value_t = 1)]
    latency_ms: u64,

    /// Give up waiting for the workload after this many seconds
    #[arg(long = "drain-timeout-secs", default_value_t = 60)]
    drain_timeout_secs: u64,

    #[command(flatten)]
    engine: EngineArgs,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if args.keys == 0 {
        return Err("--keys must be at least 1".into());
    }
    if args.jobs_per_key == 0 {
        return Err("--jobs-per-key must be at least 1".into());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct Report {
    drained: bool,
    ordered: bool,
    elapsed_ms: u128,
    stats: CoordinatorStats,
}

/// Job indices per key, in the order their main workers first ran.
type StartLog = Arc<Mutex<HashMap<String, Vec<usize>>>>;

fn submit_workload(coordinator: &JobCoordinator, args: &Args, starts: &StartLog) {
    let op_counter = Arc::new(AtomicU64::new(0));
    let latency = Duration::from_millis(args.latency_ms);
    let fail_every = args.fail_every;

    for index in 0..args.jobs_per_key {
        for k in 0..args.keys {
            let key = format!("node-{k}");
            let starts = starts.clone();
            let op_counter = op_counter.clone();
            let job_key = key.clone();
            JobBuilder::new(key, move || {
                {
                    let mut starts = starts.lock().unwrap_or_else(|e| e.into_inner());
                    let seen = starts.entry(job_key.clone()).or_default();
                    if seen.last() != Some(&index) {
                        seen.push(index);
                    }
                }
                let n = op_counter.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(vec![op(async move {
                    Timer::after(latency).await;
                    if fail_every > 0 && n % fail_every == 0 {
                        bail!("synthetic failure of operation {n}");
                    }
                    Ok(json!(n))
                })])
            })
            .on_success(|outputs| {
                debug!("Confirmed operations {outputs:?}");
                Ok(Vec::new())
            })
            .on_rollback(|pending| {
                debug!("Rolling back {} operations", pending.len());
                Ok(vec![ready_op(json!("rolled back"))])
            })
            .max_retries(args.max_retries)
            .enqueue(coordinator);
        }
    }
}

fn is_ordered(starts: &StartLog, jobs_per_key: usize) -> bool {
    let starts = starts.lock().unwrap_or_else(|e| e.into_inner());
    starts.iter().all(|(key, seen)| {
        let ordered = seen.iter().copied().eq(0..jobs_per_key);
        if !ordered {
            error!("Jobs of {key} started out of order: {seen:?}");
        }
        ordered
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let coordinator = JobCoordinator::new(args.engine.to_config()?)?;
    coordinator.start()?;

    info!(
        "Submitting {} jobs over {} keys",
        args.keys * args.jobs_per_key,
        args.keys
    );
    let started = Instant::now();
    let starts: StartLog = Arc::new(Mutex::new(HashMap::new()));
    submit_workload(&coordinator, &args, &starts);

    let drained = coordinator.wait_until_idle(Duration::from_secs(args.drain_timeout_secs));
    let report = Report {
        drained,
        ordered: is_ordered(&starts, args.jobs_per_key),
        elapsed_ms: started.elapsed().as_millis(),
        stats: coordinator.stats(),
    };
    coordinator.stop();

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.drained || !report.ordered {
        std::process::exit(1);
    }
    Ok(())
}
