use crate::config::EngineConfig;
use crate::job_engine::async_op::{failed_op, op, ready_op, AsyncOp};
use crate::job_engine::coordinator::JobCoordinator;
use crate::job_engine::job_builder::JobBuilder;

use anyhow::anyhow;
use async_channel::Receiver;
use async_io::Timer;
use futures::FutureExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn started_coordinator(idle_backoff: Duration) -> JobCoordinator {
    init_logging();
    let config = EngineConfig::default()
        .with_shards(4)
        .with_worker_threads(4)
        .with_idle_backoff(idle_backoff);
    let coordinator = JobCoordinator::new(config).unwrap();
    coordinator.start().unwrap();
    coordinator
}

fn coordinator() -> JobCoordinator {
    started_coordinator(Duration::from_millis(20))
}

/// Simple shared invocation counter
fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn delayed_op(delay: Duration) -> AsyncOp {
    op(async move {
        Timer::after(delay).await;
        Ok(json!(null))
    })
}

fn gated_op(gate: Receiver<()>) -> AsyncOp {
    op(async move {
        let _ = gate.recv().await;
        Ok(json!("released"))
    })
}

fn recv_within<T>(rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    async_io::block_on(async {
        let received = rx.recv().fuse();
        let timer = Timer::after(timeout).fuse();
        futures::pin_mut!(received, timer);
        futures::select! {
            value = received => value.ok(),
            _ = timer => None,
        }
    })
}

//
// 1. Ordering and mutual exclusion per key
//
#[test]
fn test_jobs_of_one_key_run_in_submission_order() {
    let coordinator = coordinator();
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicBool::new(false));
    let overlaps = counter();

    for i in 0..20 {
        let order = order.clone();
        let active = active.clone();
        let overlaps = overlaps.clone();
        JobBuilder::new("openflow:1", move || {
            if active.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            order.lock().unwrap().push(i);
            let active = active.clone();
            Ok(vec![op(async move {
                Timer::after(Duration::from_millis(2)).await;
                active.store(false, Ordering::SeqCst);
                Ok(json!(i))
            })])
        })
        .enqueue(&coordinator);
    }

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.stats().succeeded, 20);
}

//
// 2. Different keys run in parallel
//
#[test]
fn test_distinct_keys_do_not_wait_for_each_other() {
    let coordinator = coordinator();
    let (release, gate) = async_channel::unbounded::<()>();
    let (done_tx, done_rx) = async_channel::unbounded::<&'static str>();

    JobBuilder::new("blocked", move || Ok(vec![gated_op(gate.clone())])).enqueue(&coordinator);

    let done = done_tx.clone();
    JobBuilder::new("free", move || {
        let done = done.clone();
        Ok(vec![op(async move {
            let _ = done.send("free").await;
            Ok(json!(null))
        })])
    })
    .enqueue(&coordinator);

    assert_eq!(recv_within(&done_rx, WAIT), Some("free"));
    // the blocked job is still holding its key
    assert!(coordinator.stats().outstanding() >= 1);

    release.send_blocking(()).unwrap();
    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(coordinator.stats().succeeded, 2);
}

//
// 3. Retries without rollback
//
#[test]
fn test_retry_exhaustion_invokes_main_max_retries_times() {
    let coordinator = coordinator();
    let calls = counter();

    let c = calls.clone();
    JobBuilder::new("flaky", move || {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(vec![failed_op(anyhow!("switch disconnected"))])
    })
    .max_retries(3)
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = coordinator.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.rolled_back, 0);
}

#[test]
fn test_zero_retries_means_a_single_attempt() {
    let coordinator = coordinator();
    let calls = counter();
    let rollbacks = counter();

    let c = calls.clone();
    let r = rollbacks.clone();
    JobBuilder::new("once", move || {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(vec![failed_op(anyhow!("rejected"))])
    })
    .on_rollback(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    })
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
}

//
// 4. Rollback after exhausted retries
//
#[test]
fn test_rollback_runs_once_and_clears_the_job() {
    let coordinator = coordinator();
    let main_calls = counter();
    let rollback_calls = counter();
    let success_calls = counter();

    let m = main_calls.clone();
    let r = rollback_calls.clone();
    let s = success_calls.clone();
    JobBuilder::new("A", move || {
        m.fetch_add(1, Ordering::SeqCst);
        Ok(vec![failed_op(anyhow!("bundle add failed"))])
    })
    .on_success(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    })
    .on_rollback(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ready_op(json!("bundle discarded"))])
    })
    .max_retries(2)
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(main_calls.load(Ordering::SeqCst), 2);
    assert_eq!(rollback_calls.load(Ordering::SeqCst), 1);
    assert_eq!(success_calls.load(Ordering::SeqCst), 0);
    let stats = coordinator.stats();
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(stats.double_faults, 0);
}

#[test]
fn test_rollback_inspects_the_failed_attempt() {
    let coordinator = coordinator();
    let (seen_tx, seen_rx) = async_channel::unbounded::<(usize, bool, bool)>();

    JobBuilder::new("inspect", || {
        Ok(vec![
            ready_op(json!("group added")),
            failed_op(anyhow!("flow rejected")),
        ])
    })
    .on_rollback(move |pending| {
        // await the whole attempt before reporting what happened to it
        let attempt = pending.to_vec();
        let seen = seen_tx.clone();
        Ok(vec![op(async move {
            for pending_op in &attempt {
                let _ = pending_op.clone().await;
            }
            let _ = seen
                .send((
                    attempt.len(),
                    attempt[0].has_failed(),
                    attempt[1].has_failed(),
                ))
                .await;
            Ok(json!(null))
        })])
    })
    .max_retries(1)
    .enqueue(&coordinator);

    assert_eq!(recv_within(&seen_rx, WAIT), Some((2, false, true)));
    assert!(coordinator.wait_until_idle(WAIT));
}

//
// 5. Double fault containment
//
#[test]
fn test_failed_rollback_is_a_contained_double_fault() {
    let coordinator = coordinator();
    let rollback_calls = counter();
    let next_job = counter();

    let r = rollback_calls.clone();
    JobBuilder::new("B", || Ok(vec![failed_op(anyhow!("main failed"))]))
        .on_rollback(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(vec![failed_op(anyhow!("rollback failed too"))])
        })
        .max_retries(2)
        .enqueue(&coordinator);

    let n = next_job.clone();
    JobBuilder::new("B", move || {
        n.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ready_op(json!(null))])
    })
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(rollback_calls.load(Ordering::SeqCst), 1);
    assert_eq!(next_job.load(Ordering::SeqCst), 1);
    let stats = coordinator.stats();
    assert_eq!(stats.double_faults, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(coordinator.key_count(), 0);
}

#[test]
fn test_erroring_rollback_worker_is_not_counted_as_rolled_back() {
    let coordinator = coordinator();
    let rollbacks = counter();

    let r = rollbacks.clone();
    JobBuilder::new("R", || Ok(vec![failed_op(anyhow!("flow mod rejected"))]))
        .on_rollback(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("bundle already gone"))
        })
        .enqueue(&coordinator);
    JobBuilder::new("R", || Ok(vec![failed_op(anyhow!("flow mod rejected"))]))
        .on_rollback(|_| panic!("rollback bug"))
        .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    let stats = coordinator.stats();
    assert_eq!(stats.rollback_errors, 2);
    assert_eq!(stats.rolled_back, 0);
    assert_eq!(stats.double_faults, 0);
    assert_eq!(stats.worker_errors, 2);
    assert_eq!(stats.cleared, 2);
}

//
// 6. Empty operation lists
//
#[test]
fn test_no_operations_clears_without_continuations() {
    let coordinator = coordinator();
    let continuations = counter();

    let s = continuations.clone();
    let r = continuations.clone();
    JobBuilder::new("empty", || Ok(Vec::new()))
        .on_success(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
        .on_rollback(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
        .max_retries(3)
        .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(continuations.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.stats().succeeded, 1);
}

//
// 7. Worker errors and panics
//
#[test]
fn test_worker_errors_and_panics_do_not_wedge_the_key() {
    let coordinator = coordinator();
    let after = counter();

    JobBuilder::new("C", || Err(anyhow!("could not build flow mod"))).enqueue(&coordinator);
    JobBuilder::new("C", || panic!("worker bug")).enqueue(&coordinator);
    let a = after.clone();
    JobBuilder::new("C", move || {
        a.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ready_op(json!(null))])
    })
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(after.load(Ordering::SeqCst), 1);
    let stats = coordinator.stats();
    assert_eq!(stats.worker_errors, 2);
    assert_eq!(stats.cleared, 3);
}

//
// 8. Success continuation
//
#[test]
fn test_success_worker_receives_outputs_in_order() {
    let coordinator = coordinator();
    let received = Arc::new(Mutex::new(Vec::new()));

    let rec = received.clone();
    JobBuilder::new("D", || {
        Ok(vec![
            op(async {
                Timer::after(Duration::from_millis(10)).await;
                Ok(json!("first"))
            }),
            ready_op(json!("second")),
        ])
    })
    .on_success(move |outputs| {
        rec.lock().unwrap().extend_from_slice(outputs);
        Ok(Vec::new())
    })
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(*received.lock().unwrap(), vec![json!("first"), json!("second")]);
}

#[test]
fn test_failing_success_worker_consumes_retries() {
    let coordinator = coordinator();
    let main_calls = counter();
    let success_calls = counter();
    let rollback_calls = counter();

    let m = main_calls.clone();
    let s = success_calls.clone();
    let r = rollback_calls.clone();
    JobBuilder::new("E", move || {
        m.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ready_op(json!(null))])
    })
    .on_success(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        Ok(vec![failed_op(anyhow!("commit failed"))])
    })
    .on_rollback(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    })
    .max_retries(2)
    .enqueue(&coordinator);

    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(main_calls.load(Ordering::SeqCst), 2);
    assert_eq!(success_calls.load(Ordering::SeqCst), 2);
    assert_eq!(rollback_calls.load(Ordering::SeqCst), 1);
}

//
// 9. Idle key reclamation
//
#[test]
fn test_idle_keys_are_reclaimed() {
    // a long backoff shows that finishing a job wakes the scheduler
    let coordinator = started_coordinator(Duration::from_secs(30));
    for key in ["x", "y", "z"] {
        JobBuilder::new(key, || Ok(vec![delayed_op(Duration::from_millis(5))]))
            .enqueue(&coordinator);
    }
    assert!(coordinator.key_count() > 0);
    assert!(coordinator.wait_until_idle(Duration::from_secs(5)));
    assert_eq!(coordinator.key_count(), 0);
}

#[test]
fn test_all_drain_waiters_return_once_idle() {
    let coordinator = Arc::new(started_coordinator(Duration::from_secs(30)));
    let (release, gate) = async_channel::unbounded::<()>();
    JobBuilder::new("drain", move || Ok(vec![gated_op(gate.clone())])).enqueue(&coordinator);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.wait_until_idle(WAIT))
        })
        .collect();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(coordinator.stats().outstanding(), 1);

    let released = std::time::Instant::now();
    release.send_blocking(()).unwrap();
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
    assert!(released.elapsed() < Duration::from_secs(5));
    assert_eq!(coordinator.key_count(), 0);
}

//
// 10. Lifecycle
//
#[test]
fn test_jobs_wait_for_start() {
    init_logging();
    let coordinator = JobCoordinator::new(
        EngineConfig::default()
            .with_shards(2)
            .with_idle_backoff(Duration::from_millis(20)),
    )
    .unwrap();
    assert_eq!(coordinator.config().shards, 2);
    let calls = counter();
    let c = calls.clone();
    JobBuilder::new("later", move || {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    })
    .enqueue(&coordinator);

    assert!(!coordinator.is_running());
    assert!(!coordinator.wait_until_idle(Duration::from_millis(100)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    coordinator.start().unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.is_running());
    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_abandons_in_flight_and_later_jobs() {
    let coordinator = coordinator();
    let (_release, gate) = async_channel::unbounded::<()>();
    let later = counter();

    JobBuilder::new("stuck", move || Ok(vec![gated_op(gate.clone())])).enqueue(&coordinator);
    // give the scheduler a moment to dispatch the stuck job
    std::thread::sleep(Duration::from_millis(100));
    coordinator.stop();
    coordinator.stop();
    assert!(!coordinator.is_running());
    assert!(coordinator.start().is_err());

    let l = later.clone();
    JobBuilder::new("other", move || {
        l.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    })
    .enqueue(&coordinator);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.stats().outstanding(), 2);
}

#[test]
fn test_engines_are_independent() {
    let first = coordinator();
    let second = coordinator();
    JobBuilder::new("shared-key", || Ok(vec![ready_op(json!(1))])).enqueue(&first);
    assert!(first.wait_until_idle(WAIT));
    assert_eq!(first.stats().enqueued, 1);
    assert_eq!(second.stats().enqueued, 0);
    assert_eq!(first.shard_for("shared-key"), second.shard_for("shared-key"));
}

//
// 11. Stress: many keys, many jobs
//
#[test]
fn test_many_keys_from_many_threads() {
    let coordinator = Arc::new(coordinator());
    let results = Arc::new(Mutex::new(Vec::new()));

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let coordinator = coordinator.clone();
            let results = results.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    let results = results.clone();
                    JobBuilder::new(format!("node-{t}"), move || {
                        results.lock().unwrap().push((t, i));
                        Ok(vec![ready_op(json!(i))])
                    })
                    .enqueue(&coordinator);
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    assert!(coordinator.wait_until_idle(WAIT));
    let buf = results.lock().unwrap();
    assert_eq!(buf.len(), 100);
    // each key must preserve *its* order, keys may interleave
    for t in 0..4 {
        let per_key: Vec<_> = buf.iter().filter(|(k, _)| *k == t).map(|(_, i)| *i).collect();
        assert_eq!(per_key, (0..25).collect::<Vec<_>>());
    }
}
