//! Integration tests for the debounce lifecycle
//!
//! These tests run the debouncer against its real worker pool with wall-clock
//! delays: bursts collapsing to the last action, supersession of queued and
//! running actions, and shutdown draining.

use debouncer::{Debouncer, Error, ScheduledPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (only runs once even if called multiple times)
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("debouncer=debug".parse().unwrap()),
            )
            .with_test_writer()
            .init();
    });
}

#[test]
fn single_schedule_runs_exactly_once_after_the_delay() {
    init_tracing();

    let mut debouncer = Debouncer::new(Duration::from_millis(80));
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduled_at = Instant::now();

    let (tx, rx) = mpsc::channel();
    let runs_in_action = runs.clone();
    debouncer
        .schedule(move |_flag| {
            runs_in_action.fetch_add(1, Ordering::SeqCst);
            tx.send(Instant::now()).unwrap();
        })
        .unwrap();

    let ran_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ran_at.duration_since(scheduled_at) >= Duration::from_millis(80));

    // Nothing else fires afterwards.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn burst_of_schedules_runs_only_the_final_action() {
    init_tracing();

    let mut debouncer = Debouncer::new(Duration::from_millis(150));
    let executed = Arc::new(Mutex::new(Vec::new()));
    let burst_started = Instant::now();

    for (label, gap) in [("a", 30u64), ("b", 30), ("c", 0)] {
        let executed = executed.clone();
        debouncer
            .schedule(move |_flag| executed.lock().unwrap().push((label, Instant::now())))
            .unwrap();
        thread::sleep(Duration::from_millis(gap));
    }

    debouncer.wait_for_pending_task().unwrap();
    thread::sleep(Duration::from_millis(100));

    let executed = executed.lock().unwrap();
    assert_eq!(executed.len(), 1, "only the final schedule may run");
    let (label, ran_at) = executed[0];
    assert_eq!(label, "c");
    // c went in roughly 60ms into the burst and the quiet period restarts
    // with each schedule, so it fires no earlier than 60ms + 150ms.
    assert!(ran_at.duration_since(burst_started) >= Duration::from_millis(210));
}

#[test]
fn pile_of_immediate_submissions_keeps_first_running_and_last_queued() {
    init_tracing();

    let mut debouncer = Debouncer::new(Duration::from_millis(20));
    let executed = Arc::new(Mutex::new(Vec::new()));

    // Park the worker inside the first action so the following submissions
    // pile up behind it.
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    {
        let executed = executed.clone();
        debouncer
            .submit_immediately(move |flag| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                executed.lock().unwrap().push(("first", flag.is_cancelled()));
            })
            .unwrap();
    }
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    for label in ["second", "third", "fourth"] {
        let executed = executed.clone();
        debouncer
            .submit_immediately(move |flag| {
                executed.lock().unwrap().push((label, flag.is_cancelled()));
            })
            .unwrap();
    }

    release_tx.send(()).unwrap();
    debouncer.wait_for_pending_task().unwrap();

    let executed = executed.lock().unwrap();
    // The parked first action still finished since cancellation is advisory,
    // but it saw its flag flip. The intermediate submissions never started
    // and the last one ran with a clear flag.
    assert_eq!(*executed, vec![("first", true), ("fourth", false)]);
}

#[test]
fn shutdown_with_await_drains_scheduled_work() {
    init_tracing();

    let mut debouncer = Debouncer::new(Duration::from_millis(60));
    let finished = Arc::new(AtomicUsize::new(0));
    let finished_in_action = finished.clone();
    debouncer
        .schedule(move |_flag| {
            thread::sleep(Duration::from_millis(40));
            finished_in_action.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    debouncer.shutdown(true);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(debouncer.schedule(|_flag| {}), Err(Error::Closed));
}

#[test]
fn caller_supplied_pool_is_shared_and_closed_together() {
    init_tracing();

    let pool = Arc::new(ScheduledPool::new(2));
    let mut debouncer = Debouncer::with_pool(Duration::from_millis(30), pool.clone());

    let (tx, rx) = mpsc::channel();
    debouncer.schedule(move |_flag| tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    debouncer.shutdown(false);
    assert!(pool.is_closed());
    assert_eq!(pool.submit(|| {}).err(), Some(Error::Closed));
}

#[test]
fn failed_submission_leaves_the_previous_action_cancelled() {
    init_tracing();

    let pool = Arc::new(ScheduledPool::new(1));
    let mut debouncer = Debouncer::with_pool(Duration::from_millis(200), pool.clone());

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in_action = ran.clone();
    debouncer
        .schedule(move |_flag| {
            ran_in_action.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    // Close behind the debouncer's back; the next submission fails after
    // having already cancelled the pending action.
    pool.close();
    assert_eq!(debouncer.schedule(|_flag| {}), Err(Error::Closed));
    assert_eq!(debouncer.wait_for_pending_task(), Err(Error::Cancelled));

    assert!(pool.close_and_await(Duration::from_secs(5)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
