// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

// Runs a single job whose main work always fails and prints the resulting trace.

use std::time::Duration;

use clap::Parser;
use jobcoord::{ready_op, CoordinatorStats, EngineConfig, JobBuilder, JobCoordinator};
use jobcoord_tests::ops::fail_with;
use jobcoord_tests::probe::{Probe, TraceLog, TracePhase};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Parser)]
struct Args {
    /// Key of the job
    #[arg(long, default_value = "A")]
    key: String,

    #[arg(long = "max-retries", default_value_t = 2)]
    max_retries: u32,

    /// Let the rollback fail as well
    #[arg(long = "failing-rollback")]
    failing_rollback: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ScenarioReport {
    pub trace: TraceLog,
    pub stats: CoordinatorStats,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let coordinator = JobCoordinator::new(
        EngineConfig::default().with_idle_backoff(Duration::from_millis(10)),
    )?;
    coordinator.start()?;

    let probe = Probe::new();
    let main_probe = probe.clone();
    let rollback_probe = probe.clone();
    let main_key = args.key.clone();
    let rollback_key = args.key.clone();
    let failing_rollback = args.failing_rollback;
    JobBuilder::new(args.key.clone(), move || {
        main_probe.record(&main_key, TracePhase::Main);
        Ok(vec![fail_with("flow mod rejected")])
    })
    .on_rollback(move |_| {
        rollback_probe.record(&rollback_key, TracePhase::Rollback);
        if failing_rollback {
            Ok(vec![fail_with("bundle discard rejected")])
        } else {
            Ok(vec![ready_op(json!("bundle discarded"))])
        }
    })
    .max_retries(args.max_retries)
    .enqueue(&coordinator);

    if !coordinator.wait_until_idle(Duration::from_secs(30)) {
        anyhow::bail!("the scenario did not finish within 30 seconds");
    }
    let report = ScenarioReport {
        trace: probe.snapshot(),
        stats: coordinator.stats(),
    };
    coordinator.stop();
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
