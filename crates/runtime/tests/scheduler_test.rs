//! End-to-end behavior of the adaptive pool: bounded concurrency, FIFO
//! ordering, idle shutdown and restart-on-queue.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use stellwerk_runtime::{HostState, Scheduler, Task, TunableValues, Tunables};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tunables(values: TunableValues) -> Arc<Tunables> {
    Tunables::fixed(values)
}

#[tokio::test]
async fn pool_never_exceeds_max_threads() -> Result<()> {
    init_tracing();
    let scheduler = Scheduler::new(
        "bounded",
        tunables(TunableValues {
            max_threads: 2,
            creation_threshold: 1,
            termination_threshold: 10,
            poll_interval_ms: 5,
            stop_timeout_ms: 1000,
        }),
    );

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut units = Vec::new();

    for i in 0..5 {
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        let unit = scheduler
            .queue(Task::oneshot(format!("work-{i}"), move || {
                let concurrent = Arc::clone(&concurrent);
                let peak = Arc::clone(&peak);
                async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();
        units.push(unit);
    }

    for unit in units {
        unit.promise
            .wait_timeout(Duration::from_secs(5))
            .await?
            .unwrap();
    }

    let observed = peak.load(Ordering::SeqCst);
    assert!(observed >= 1, "no unit ever ran");
    assert!(observed <= 2, "concurrency {observed} exceeded the bound");
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn single_processor_preserves_submission_order() {
    init_tracing();
    let scheduler = Scheduler::new(
        "fifo",
        tunables(TunableValues {
            max_threads: 1,
            creation_threshold: 100,
            termination_threshold: 50,
            poll_interval_ms: 5,
            stop_timeout_ms: 1000,
        }),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut units = Vec::new();
    for i in 0..8u32 {
        let order = Arc::clone(&order);
        let unit = scheduler
            .queue(Task::oneshot(format!("step-{i}"), move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                }
            }))
            .await
            .unwrap();
        units.push(unit);
    }

    for unit in units {
        unit.promise
            .wait_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<u32>>());
    let _ = scheduler.shutdown().await;
}

#[tokio::test]
async fn idle_pool_shuts_down_and_restarts_on_queue() {
    init_tracing();
    let scheduler = Scheduler::new(
        "elastic",
        tunables(TunableValues {
            max_threads: 2,
            creation_threshold: 1,
            termination_threshold: 2,
            poll_interval_ms: 5,
            stop_timeout_ms: 1000,
        }),
    );

    let first = scheduler
        .queue(Task::oneshot("first", || async { Ok(()) }))
        .await
        .unwrap();
    first
        .promise
        .wait_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    // Drained pool winds itself down once the idle streak passes the
    // termination threshold.
    let mut stopped = false;
    for _ in 0..100 {
        if scheduler.host().state().await == HostState::Stopped {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped, "pool did not shut down while idle");

    // A fresh queue call brings it back.
    let second = scheduler
        .queue(Task::oneshot("second", || async { Ok(()) }))
        .await
        .unwrap();
    second
        .promise
        .wait_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scheduler.host().state().await, HostState::Running);
    let _ = scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_queued_units_for_the_next_run() {
    init_tracing();
    let scheduler = Scheduler::new(
        "carryover",
        tunables(TunableValues {
            max_threads: 1,
            creation_threshold: 1,
            termination_threshold: 50,
            poll_interval_ms: 5,
            stop_timeout_ms: 1000,
        }),
    );

    let gate = Arc::new(tokio::sync::Notify::new());
    let gate2 = Arc::clone(&gate);
    let blocker = scheduler
        .queue(Task::oneshot("blocker", move || {
            let gate = Arc::clone(&gate2);
            async move {
                gate.notified().await;
                Ok(())
            }
        }))
        .await
        .unwrap();

    // Give the blocker time to occupy the only processor, then stack a
    // second unit behind it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let hits = Arc::new(AtomicU32::new(0));
    let hits2 = Arc::clone(&hits);
    let waiting = scheduler
        .queue(Task::oneshot("waiting", move || {
            let hits = Arc::clone(&hits2);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .await
        .unwrap();

    gate.notify_waiters();
    blocker
        .promise
        .wait_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    waiting
        .promise
        .wait_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let _ = scheduler.shutdown().await;
}
