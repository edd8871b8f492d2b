//! Integration tests for Taskq
//!
//! These tests validate real-world functionality including:
//! - Exactly-once execution on an affiliated worker
//! - Front-priority ordering with a single worker
//! - Delayed dispatch, including already-due deadlines
//! - Cancellation outcomes and entry release
//! - Wait semantics, stale handles and caller-owned entries
//! - Thread affiliation across queues
//! - Allocation exhaustion, panics and destroy

use prometheus_taskq::config::{ContextConfig, TaskqConfig};
use prometheus_taskq::core::{
    CancelOutcome, DispatchFlags, EntryKind, Taskq, TaskqContext, TaskqEnt, TaskqError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn context(max_entries: usize, parallelism: usize) -> Arc<TaskqContext> {
    TaskqContext::new(
        &ContextConfig::new()
            .with_max_entries(max_entries)
            .with_parallelism(parallelism),
    )
    .unwrap()
}

fn queue(ctx: &Arc<TaskqContext>, name: &str, threads: usize) -> Taskq {
    Taskq::create(ctx, &TaskqConfig::new(name).with_threads(threads)).unwrap()
}

/// Occupy a worker until the returned sender is used or dropped.
///
/// Returns once the blocking task has started.
fn block_worker(tq: &Taskq) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    tq.dispatch(
        move |()| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        },
        (),
        DispatchFlags::SLEEP,
    )
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    release_tx
}

fn recorder() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Arc<Mutex<Vec<String>>>, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

// ============================================================================
// DISPATCH
// ============================================================================

#[test]
fn test_dispatch_runs_once_with_argument_on_member_thread() {
    let ctx = context(64, 4);
    let tq = queue(&ctx, "exactly_once", 3);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for n in 0..32_u32 {
        let seen = Arc::clone(&seen);
        let ctx = Arc::clone(&ctx);
        let owner = tq.clone();
        tq.dispatch(
            move |arg: u32| {
                let me = thread::current().id();
                let current = ctx.current_taskq().expect("worker is affiliated");
                assert!(current.same_queue(&owner));
                assert!(owner.member(me));
                seen.lock().unwrap().push(arg);
            },
            n,
            DispatchFlags::SLEEP,
        )
        .unwrap();
    }
    tq.wait().unwrap();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..32).collect::<Vec<_>>());
    assert_eq!(ctx.allocator().in_use(), 0);

    let stats = tq.stats();
    assert_eq!(stats.dispatched, 32);
    assert_eq!(stats.completed, 32);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);

    tq.destroy().unwrap();
}

#[test]
fn test_worker_threads_are_named_after_queue() {
    let ctx = context(4, 2);
    let tq = queue(&ctx, "named_q", 1);
    let (tx, rx) = mpsc::channel();

    tq.dispatch(
        move |()| tx.send(thread::current().name().map(str::to_owned)).unwrap(),
        (),
        DispatchFlags::SLEEP,
    )
    .unwrap();

    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(name.starts_with("named_q-"), "unexpected worker name {name}");
    tq.destroy().unwrap();
}

#[test]
fn test_front_priority_runs_before_pending_normal_tasks() {
    let ctx = context(64, 1);
    let tq = queue(&ctx, "front_q", 1);
    let log = recorder();

    let gate = block_worker(&tq);
    for n in 0..5 {
        let log = Arc::clone(&log);
        tq.dispatch(move |n: i32| push(&log, format!("normal-{n}")), n, DispatchFlags::SLEEP)
            .unwrap();
    }
    let front_log = Arc::clone(&log);
    tq.dispatch(
        move |()| push(&front_log, "front"),
        (),
        DispatchFlags::SLEEP.front(),
    )
    .unwrap();

    drop(gate);
    tq.wait().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 6);
    assert_eq!(log[0], "front");
    assert_eq!(log[1..], ["normal-0", "normal-1", "normal-2", "normal-3", "normal-4"]);
    tq.destroy().unwrap();
}

#[test]
fn test_front_task_cannot_preempt_running_task() {
    let ctx = context(16, 1);
    let tq = queue(&ctx, "preempt_q", 1);
    let log = recorder();
    let (a_started_tx, a_started_rx) = mpsc::channel();

    let a_log = Arc::clone(&log);
    tq.dispatch(
        move |()| {
            push(&a_log, "A-start");
            a_started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            push(&a_log, "A-finish");
        },
        (),
        DispatchFlags::SLEEP,
    )
    .unwrap();
    a_started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let b_log = Arc::clone(&log);
    tq.dispatch(
        move |()| {
            push(&b_log, "B-start");
            push(&b_log, "B-finish");
        },
        (),
        DispatchFlags::SLEEP.front(),
    )
    .unwrap();
    let c_log = Arc::clone(&log);
    tq.dispatch(
        move |()| {
            push(&c_log, "C-start");
            push(&c_log, "C-finish");
        },
        (),
        DispatchFlags::SLEEP,
    )
    .unwrap();

    tq.wait().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["A-start", "A-finish", "B-start", "B-finish", "C-start", "C-finish"]
    );
    tq.destroy().unwrap();
}

#[test]
fn test_cpu_percent_thread_counts() {
    let ctx = context(16, 8);

    let half = Taskq::create(&ctx, &TaskqConfig::new("half").with_cpu_percent(50)).unwrap();
    let one = Taskq::create(&ctx, &TaskqConfig::new("one").with_cpu_percent(1)).unwrap();
    assert_eq!(half.thread_count(), 4);
    assert_eq!(one.thread_count(), 1);
    assert_eq!(half.stats().threads, 4);

    half.destroy().unwrap();
    one.destroy().unwrap();
}

// ============================================================================
// DELAYED DISPATCH
// ============================================================================

#[test]
fn test_due_deadline_collapses_to_immediate_dispatch() {
    let ctx = context(16, 1);
    let tq = queue(&ctx, "collapse_q", 1);
    let log = recorder();

    let gate = block_worker(&tq);
    let first = Arc::clone(&log);
    tq.dispatch(move |()| push(&first, "immediate"), (), DispatchFlags::SLEEP)
        .unwrap();
    let second = Arc::clone(&log);
    let id = tq
        .dispatch_delay(
            move |()| push(&second, "due"),
            (),
            DispatchFlags::SLEEP,
            Instant::now(),
        )
        .unwrap();

    let info = ctx.allocator().inspect(id).unwrap().unwrap();
    assert_eq!(info.kind, EntryKind::Normal);
    assert!(info.timer.is_none());
    assert_eq!(tq.stats().armed, 0);
    assert_eq!(tq.stats().pending, 2);

    drop(gate);
    tq.wait().unwrap();
    assert_eq!(*log.lock().unwrap(), ["immediate", "due"]);
    tq.destroy().unwrap();
}

#[test]
fn test_delayed_dispatch_runs_after_deadline() {
    let ctx = context(16, 2);
    let tq = queue(&ctx, "delay_q", 2);
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    let id = tq
        .dispatch_after(
            move |tag: &'static str| tx.send((tag, Instant::now())).unwrap(),
            "late",
            DispatchFlags::SLEEP,
            Duration::from_millis(40),
        )
        .unwrap();

    let info = ctx.allocator().inspect(id).unwrap().unwrap();
    assert!(matches!(info.kind, EntryKind::Timeout { .. }));

    let (tag, ran_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(tag, "late");
    assert!(ran_at.duration_since(start) >= Duration::from_millis(40));

    tq.wait_id(Some(id)).unwrap();
    assert_eq!(ctx.allocator().in_use(), 0);
    tq.destroy().unwrap();
}

#[test]
fn test_unbounded_delay_never_fires_and_is_released() {
    let ctx = context(4, 1);
    let tq = queue(&ctx, "forever_q", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    let id = tq
        .dispatch_after(
            move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            (),
            DispatchFlags::SLEEP,
            Duration::MAX,
        )
        .unwrap();
    assert_eq!(tq.stats().armed, 1);
    assert_eq!(ctx.allocator().in_use(), 1);
    assert_eq!(tq.cancel_id(Some(id)).unwrap(), CancelOutcome::Cancelled);

    tq.dispatch_after(|()| {}, (), DispatchFlags::SLEEP, Duration::MAX)
        .unwrap();
    tq.destroy().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.allocator().in_use(), 0);
}

#[test]
fn test_wait_covers_armed_delayed_tasks() {
    let ctx = context(16, 2);
    let tq = queue(&ctx, "wait_delay_q", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    tq.dispatch_after(
        move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        (),
        DispatchFlags::SLEEP,
        Duration::from_millis(30),
    )
    .unwrap();

    tq.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    tq.destroy().unwrap();
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancel_pending_task() {
    let ctx = context(16, 1);
    let tq = queue(&ctx, "cancel_q", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    let gate = block_worker(&tq);
    let counter = Arc::clone(&ran);
    let id = tq
        .dispatch(
            move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            (),
            DispatchFlags::SLEEP,
        )
        .unwrap();

    assert_eq!(tq.cancel_id(Some(id)).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(tq.cancel_id(Some(id)).unwrap(), CancelOutcome::NotFound);
    assert_eq!(ctx.allocator().in_use(), 1);

    drop(gate);
    tq.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.allocator().in_use(), 0);
    assert_eq!(tq.stats().cancelled, 1);
    tq.destroy().unwrap();
}

#[test]
fn test_cancel_delayed_task_before_fire() {
    let ctx = context(16, 1);
    let tq = queue(&ctx, "cancel_delay_q", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    let id = tq
        .dispatch_after(
            move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            (),
            DispatchFlags::SLEEP,
            Duration::from_secs(30),
        )
        .unwrap();
    assert_eq!(tq.stats().armed, 1);

    assert_eq!(tq.cancel_id(Some(id)).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(tq.stats().armed, 0);
    assert_eq!(ctx.allocator().in_use(), 0);

    tq.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    tq.destroy().unwrap();
}

#[test]
fn test_cancel_running_task_reports_already_started() {
    let ctx = context(16, 1);
    let tq = queue(&ctx, "cancel_running_q", 1);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let id = tq
        .dispatch(
            move |()| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            },
            (),
            DispatchFlags::SLEEP,
        )
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(tq.cancel_id(Some(id)).unwrap(), CancelOutcome::AlreadyStarted);

    drop(release_tx);
    tq.wait_id(Some(id)).unwrap();
    assert_eq!(tq.cancel_id(Some(id)).unwrap(), CancelOutcome::NotFound);
    assert_eq!(tq.stats().cancelled, 0);
    tq.destroy().unwrap();
}

// ============================================================================
// WAIT AND HANDLES
// ============================================================================

#[test]
fn test_wait_id_returns_after_task_completes() {
    let ctx = context(16, 2);
    let tq = queue(&ctx, "wait_id_q", 2);
    let done = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&done);
    let id = tq
        .dispatch(
            move |ms: u64| {
                thread::sleep(Duration::from_millis(ms));
                flag.store(1, Ordering::SeqCst);
            },
            30,
            DispatchFlags::SLEEP,
        )
        .unwrap();

    tq.wait_id(Some(id)).unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    tq.destroy().unwrap();
}

#[test]
fn test_stale_handle_is_detected_after_slot_reuse() {
    let ctx = context(1, 1);
    let tq = queue(&ctx, "stale_q", 1);

    let old = tq.dispatch(|()| {}, (), DispatchFlags::SLEEP).unwrap();
    tq.wait_id(Some(old)).unwrap();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let fresh = tq
        .dispatch(
            move |()| {
                let _ = release_rx.recv();
            },
            (),
            DispatchFlags::SLEEP,
        )
        .unwrap();
    assert_eq!(fresh.slot(), old.slot());
    assert_ne!(fresh, old);

    // The stale handle must not touch the task now living in its slot.
    assert_eq!(tq.cancel_id(Some(old)).unwrap(), CancelOutcome::NotFound);
    tq.wait_id(Some(old)).unwrap();
    assert_eq!(ctx.allocator().in_use(), 1);

    drop(release_tx);
    tq.wait_id(Some(fresh)).unwrap();
    assert_eq!(ctx.allocator().in_use(), 0);
    tq.destroy().unwrap();
}

#[test]
fn test_wait_from_own_worker_is_rejected() {
    let ctx = context(16, 1);
    let tq = queue(&ctx, "self_wait_q", 1);
    let (tx, rx) = mpsc::channel();

    let me = tq.clone();
    tq.dispatch(
        move |()| {
            let waited = me.wait();
            let destroyed = me.destroy();
            tx.send((waited, destroyed)).unwrap();
        },
        (),
        DispatchFlags::SLEEP,
    )
    .unwrap();

    let (waited, destroyed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(waited, Err(TaskqError::WorkerContext)));
    assert!(matches!(destroyed, Err(TaskqError::WorkerContext)));
    tq.destroy().unwrap();
}

#[test]
fn test_wait_outstanding_drains_queue() {
    let ctx = context(64, 2);
    let tq = queue(&ctx, "outstanding_q", 2);
    let count = Arc::new(AtomicUsize::new(0));

    let mut last = None;
    for _ in 0..10 {
        let count = Arc::clone(&count);
        last = Some(
            tq.dispatch(
                move |()| {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                (),
                DispatchFlags::SLEEP,
            )
            .unwrap(),
        );
    }
    tq.wait_outstanding(last).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 10);
    tq.destroy().unwrap();
}

// ============================================================================
// CALLER-OWNED ENTRIES
// ============================================================================

#[test]
fn test_caller_owned_entry_pending_and_reuse() {
    let ctx = context(4, 1);
    let tq = queue(&ctx, "ent_q", 1);
    let ent = TaskqEnt::new();
    let total = Arc::new(AtomicUsize::new(0));
    assert!(!ent.is_pending());

    let gate = block_worker(&tq);
    let sum = Arc::clone(&total);
    tq.dispatch_ent(
        move |n: usize| {
            sum.fetch_add(n, Ordering::SeqCst);
        },
        5,
        DispatchFlags::SLEEP,
        &ent,
    )
    .unwrap();
    assert!(ent.is_pending());
    // No pool entry besides the gate task.
    assert_eq!(ctx.allocator().in_use(), 1);

    drop(gate);
    tq.wait_ent(&ent);
    assert!(!ent.is_pending());
    assert_eq!(ent.completed_runs(), 1);

    let sum = Arc::clone(&total);
    tq.dispatch_ent(
        move |n: usize| {
            sum.fetch_add(n, Ordering::SeqCst);
        },
        7,
        DispatchFlags::SLEEP,
        &ent,
    )
    .unwrap();
    tq.wait_ent(&ent);

    assert_eq!(total.load(Ordering::SeqCst), 12);
    assert_eq!(ent.completed_runs(), 2);
    tq.destroy().unwrap();
}

#[test]
fn test_redispatching_pending_entry_replaces_function() {
    let ctx = context(4, 1);
    let tq = queue(&ctx, "coalesce_q", 1);
    let ent = TaskqEnt::new();
    let log = recorder();

    let gate = block_worker(&tq);
    for tag in ["first", "second"] {
        let log = Arc::clone(&log);
        tq.dispatch_ent(move |tag: &str| push(&log, tag), tag, DispatchFlags::SLEEP, &ent)
            .unwrap();
    }
    assert_eq!(tq.stats().pending, 1);

    drop(gate);
    tq.wait().unwrap();
    assert_eq!(*log.lock().unwrap(), ["second"]);
    assert_eq!(ent.completed_runs(), 1);
    assert!(!ent.is_pending());
    tq.destroy().unwrap();
}

// ============================================================================
// THREAD AFFILIATION
// ============================================================================

#[test]
fn test_current_taskq_follows_the_worker() {
    let ctx = context(16, 2);
    let alpha = queue(&ctx, "alpha", 1);
    let beta = queue(&ctx, "beta", 1);
    let (tx, rx) = mpsc::channel();

    assert!(ctx.current_taskq().is_none());
    assert!(!alpha.member(thread::current().id()));

    for tq in [&alpha, &beta] {
        let tx = tx.clone();
        let ctx = Arc::clone(&ctx);
        tq.dispatch(
            move |()| {
                let name = ctx.current_taskq().map(|q| q.name().to_owned());
                tx.send(name).unwrap();
            },
            (),
            DispatchFlags::SLEEP,
        )
        .unwrap();
    }

    let mut names: Vec<_> = (0..2)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, ["alpha", "beta"]);

    alpha.destroy().unwrap();
    beta.destroy().unwrap();
}

#[test]
fn test_destroy_unregisters_workers() {
    let ctx = context(16, 2);
    let tq = queue(&ctx, "unregister_q", 2);
    let (tx, rx) = mpsc::channel();

    tq.dispatch(move |()| tx.send(thread::current().id()).unwrap(), (), DispatchFlags::SLEEP)
        .unwrap();
    let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ctx.taskq_of(worker).is_some());

    tq.destroy().unwrap();
    assert!(ctx.taskq_of(worker).is_none());
    assert!(!tq.member(worker));
}

// ============================================================================
// RESOURCE LIMITS AND FAILURES
// ============================================================================

#[test]
fn test_nosleep_dispatch_fails_when_entries_exhausted() {
    let ctx = context(1, 2);
    let tq = queue(&ctx, "exhausted_q", 2);

    let gate = block_worker(&tq);
    let refused = tq.dispatch(|()| {}, (), DispatchFlags::NOSLEEP);
    assert!(matches!(refused, Err(TaskqError::AllocationExhausted)));
    let refused = tq.dispatch(|()| {}, (), DispatchFlags::SLEEP.noqueue());
    assert!(matches!(refused, Err(TaskqError::AllocationExhausted)));
    assert_eq!(tq.stats().allocation_failures, 2);

    let sleeper = {
        let tq = tq.clone();
        thread::spawn(move || tq.dispatch(|()| {}, (), DispatchFlags::SLEEP))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!sleeper.is_finished());

    drop(gate);
    let id = sleeper.join().unwrap().unwrap();
    tq.wait_id(Some(id)).unwrap();
    tq.wait().unwrap();
    assert_eq!(ctx.allocator().in_use(), 0);
    tq.destroy().unwrap();
}

#[test]
fn test_panicking_task_keeps_queue_alive() {
    let ctx = context(8, 1);
    let tq = queue(&ctx, "panic_q", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    tq.dispatch(|()| panic!("task failure"), (), DispatchFlags::SLEEP)
        .unwrap();
    let counter = Arc::clone(&ran);
    tq.dispatch(
        move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        (),
        DispatchFlags::SLEEP,
    )
    .unwrap();

    tq.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(tq.stats().panicked, 1);
    assert_eq!(ctx.allocator().in_use(), 0);
    tq.destroy().unwrap();
}

#[test]
fn test_destroy_runs_pending_tasks_and_rejects_new_ones() {
    let ctx = context(64, 1);
    let tq = queue(&ctx, "destroy_q", 1);
    let count = Arc::new(AtomicUsize::new(0));

    let gate = block_worker(&tq);
    for _ in 0..5 {
        let count = Arc::clone(&count);
        tq.dispatch(
            move |()| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            (),
            DispatchFlags::SLEEP,
        )
        .unwrap();
    }
    drop(gate);

    tq.destroy().unwrap();
    tq.destroy().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 5);

    let ent = TaskqEnt::new();
    assert!(matches!(
        tq.dispatch(|()| {}, (), DispatchFlags::SLEEP),
        Err(TaskqError::ShutDown)
    ));
    assert!(matches!(
        tq.dispatch_ent(|()| {}, (), DispatchFlags::SLEEP, &ent),
        Err(TaskqError::ShutDown)
    ));
    assert!(!ent.is_pending());
    assert_eq!(ctx.allocator().in_use(), 0);
}

// ============================================================================
// ASYNC HELPERS
// ============================================================================

#[cfg(feature = "tokio-runtime")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_async() {
    let ctx = context(16, 2);
    let tq = queue(&ctx, "async_q", 2);
    let count = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for _ in 0..4 {
        let count = Arc::clone(&count);
        ids.push(
            tq.dispatch(
                move |()| {
                    thread::sleep(Duration::from_millis(5));
                    count.fetch_add(1, Ordering::SeqCst);
                },
                (),
                DispatchFlags::SLEEP,
            )
            .unwrap(),
        );
    }

    tq.wait_id_async(ids.first().copied()).await.unwrap();
    tq.wait_async().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 4);
    tq.destroy().unwrap();
}
