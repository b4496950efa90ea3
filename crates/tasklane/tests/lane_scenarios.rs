//! End-to-end lane behavior: ordering, single-flight, lane-wide cancellation,
//! and error containment.
//!
//! Run with:
//! ```sh
//! cargo test -p tasklane --test lane_scenarios -- --nocapture
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;

use tasklane::signal;
use tasklane::{
    Channel, LaneConfig, LaneError, MemoryDiagnostics, Pending, Scheduler, TaskOutcome,
};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn lane(name: &str) -> (Scheduler, Arc<MemoryDiagnostics>) {
    init_tracing();
    let sink = Arc::new(MemoryDiagnostics::new());
    let scheduler = Scheduler::with_config(LaneConfig::named(name), sink.clone())
        .expect("lane config should be valid");
    (scheduler, sink)
}

fn spin_until(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        thread::yield_now();
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────

#[test]
fn tasks_start_in_submission_order_without_overlap() {
    let (scheduler, _) = lane("X");
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut done = Vec::new();
    for name in ["A", "B", "C"] {
        let log = Arc::clone(&log);
        done.push(scheduler.submit(name, move |_| {
            log.lock().push(format!("start {name}"));
            thread::sleep(Duration::from_millis(2));
            log.lock().push(format!("end {name}"));
            Ok(())
        }));
    }
    for completion in &done {
        assert_eq!(
            completion.wait_timeout(WAIT),
            Some(TaskOutcome::Completed),
            "case=fifo_completion"
        );
    }

    assert_eq!(
        *log.lock(),
        vec!["start A", "end A", "start B", "end B", "start C", "end C"],
        "case=fifo_start_order"
    );
    assert!(scheduler.wait_idle_timeout(WAIT), "case=fifo_idle");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_single_flight_fifo(count in 1usize..12) {
        let (scheduler, _) = lane("prop");
        let running = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut last = None;
        for index in 0..count {
            let running = Arc::clone(&running);
            let overlaps = Arc::clone(&overlaps);
            let order = Arc::clone(&order);
            last = Some(scheduler.submit(format!("t{index}"), move |_| {
                if running.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                order.lock().push(index);
                thread::yield_now();
                running.store(false, Ordering::SeqCst);
                Ok(())
            }));
        }

        let last = last.expect("at least one submission");
        prop_assert_eq!(last.wait_timeout(WAIT), Some(TaskOutcome::Completed));
        prop_assert!(scheduler.wait_idle_timeout(WAIT));
        prop_assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        prop_assert_eq!(order.lock().clone(), (0..count).collect::<Vec<_>>());
    }
}

// ── Lane-wide cancellation ───────────────────────────────────────────────

#[test]
fn cancel_all_cancels_running_and_drops_queue() {
    let (scheduler, sink) = lane("compile");
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let listener_hits = Arc::new(AtomicUsize::new(0));

    let a = {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        let listener_hits = Arc::clone(&listener_hits);
        scheduler.submit("A", move |cx| {
            for _ in 0..2 {
                let hits = Arc::clone(&listener_hits);
                let _registration = cx.on_cancel(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
            entered.store(true, Ordering::SeqCst);
            // Ignores cancellation until released, so the lane must stay busy.
            spin_until(&release);
            cx.check_cancelled()
        })
    };

    let queued_runs = Arc::new(AtomicUsize::new(0));
    let mut queued = Vec::new();
    for name in ["B", "C"] {
        let runs = Arc::clone(&queued_runs);
        queued.push(scheduler.submit(name, move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }

    spin_until(&entered);
    scheduler.cancel_all();

    assert_eq!(listener_hits.load(Ordering::SeqCst), 2, "case=listeners_fired");
    assert!(scheduler.is_busy(), "case=busy_until_play_settles");
    assert_eq!(scheduler.pending_len(), 0, "case=queue_cleared");

    // A second cancel_all while A winds down fires nothing new.
    scheduler.cancel_all();
    assert_eq!(listener_hits.load(Ordering::SeqCst), 2, "case=listeners_once");

    release.store(true, Ordering::SeqCst);
    assert_eq!(a.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
    for completion in &queued {
        assert_eq!(completion.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
    }
    assert!(scheduler.wait_idle_timeout(WAIT), "case=idle_after_cancel");
    assert_eq!(queued_runs.load(Ordering::SeqCst), 0, "case=queued_never_ran");
    assert_eq!(
        sink.texts(Channel::Message),
        vec!["cancelled 'A'", "cancelled 'B'", "cancelled 'C'"]
    );
}

#[test]
fn cancel_all_interrupts_never_resolving_wait() {
    let (scheduler, sink) = lane("upload");
    let entered = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(Mutex::new(None));

    let (_never, op) = signal::pending::<Vec<u8>>();
    let done = {
        let entered = Arc::clone(&entered);
        let observed = Arc::clone(&observed);
        scheduler.submit("A", move |cx| {
            let wrapped = cx.with(op);
            entered.store(true, Ordering::SeqCst);
            let result = wrapped.wait();
            *observed.lock() = Some(result.clone());
            result.map(drop)
        })
    };

    spin_until(&entered);
    scheduler.cancel_all();

    assert_eq!(done.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
    assert_eq!(*observed.lock(), Some(Err(LaneError::Cancelled)));
    assert!(scheduler.wait_idle_timeout(WAIT));
    assert_eq!(sink.count(Channel::Error), 0);
}

#[test]
fn external_timeout_races_the_completion_signal() {
    let (scheduler, _) = lane("load");
    let (_never, op) = signal::pending::<()>();
    let done = scheduler.submit("flash", move |cx| cx.with(op).wait());

    assert_eq!(done.wait_timeout(Duration::from_millis(20)), None);
    scheduler.cancel_all();
    assert_eq!(done.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
}

#[test]
fn cancel_all_interrupts_unbounded_sleep() {
    let (scheduler, _) = lane("idle-wait");
    let entered = Arc::new(AtomicBool::new(false));
    let done = {
        let entered = Arc::clone(&entered);
        scheduler.submit("park", move |cx| {
            entered.store(true, Ordering::SeqCst);
            cx.sleep(Duration::MAX)
        })
    };

    spin_until(&entered);
    scheduler.cancel_all();
    assert_eq!(done.wait_timeout(Duration::MAX), Some(TaskOutcome::Cancelled));
    assert!(scheduler.wait_idle_timeout(Duration::MAX), "case=unbounded_idle_wait");
}

#[test]
fn work_submitted_during_wind_down_waits_its_turn() {
    let (scheduler, _) = lane("serial");
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let overlap = Arc::new(AtomicBool::new(false));
    let a_running = Arc::new(AtomicBool::new(false));

    let a = {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        let a_running = Arc::clone(&a_running);
        scheduler.submit("A", move |_| {
            a_running.store(true, Ordering::SeqCst);
            entered.store(true, Ordering::SeqCst);
            spin_until(&release);
            a_running.store(false, Ordering::SeqCst);
            Ok(())
        })
    };
    spin_until(&entered);
    scheduler.cancel_all();

    let d = {
        let overlap = Arc::clone(&overlap);
        let a_running = Arc::clone(&a_running);
        scheduler.submit("D", move |_| {
            overlap.store(a_running.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        })
    };
    assert_eq!(scheduler.pending_len(), 1);

    release.store(true, Ordering::SeqCst);
    // A ignored cancellation and returned Ok.
    assert_eq!(a.wait_timeout(WAIT), Some(TaskOutcome::Completed));
    assert_eq!(d.wait_timeout(WAIT), Some(TaskOutcome::Completed));
    assert!(!overlap.load(Ordering::SeqCst), "case=single_flight_after_cancel");
}

// ── Error containment ────────────────────────────────────────────────────

#[test]
fn failing_body_is_reported_once_and_lane_advances() {
    let (scheduler, sink) = lane("fragile");
    let failed = scheduler.submit("compile", |_| Err(LaneError::body("exit status 1")));
    let panicked = scheduler.submit("upload", |_| panic!("port vanished"));
    let next = scheduler.submit("verify", |_| Ok(()));

    assert!(failed.wait_timeout(WAIT).is_some_and(|o| o.is_failed()));
    assert!(panicked.wait_timeout(WAIT).is_some_and(|o| o.is_failed()));
    assert_eq!(next.wait_timeout(WAIT), Some(TaskOutcome::Completed));

    let errors = sink.texts(Channel::Error);
    assert_eq!(errors.len(), 2, "case=one_report_per_failure errors={errors:?}");
    assert!(errors[0].starts_with("compile: "));
    assert!(errors[1].contains("port vanished"));
}

#[test]
fn panicking_sub_operation_fails_its_task_and_lane_advances() {
    let (scheduler, sink) = lane("spawned");
    let a = scheduler.submit("A", |cx| {
        cx.with_spawned("open-port", || -> u32 { panic!("serial port closed") })
            .wait()
            .map(drop)
    });
    let b = scheduler.submit("B", |_| Ok(()));

    assert!(a.wait_timeout(WAIT).is_some_and(|o| o.is_failed()), "case=sub_op_panic_fails");
    assert_eq!(b.wait_timeout(WAIT), Some(TaskOutcome::Completed));
    assert!(scheduler.wait_idle_timeout(WAIT), "case=idle_after_sub_op_panic");

    let errors = sink.texts(Channel::Error);
    assert_eq!(errors.len(), 1, "case=one_report errors={errors:?}");
    assert!(errors[0].contains("serial port closed"));
}

#[test]
fn with_outside_running_window_is_rejected() {
    let (scheduler, _) = lane("ctx");
    let (hand_off, context) = signal::pending();
    let done = scheduler.submit("leak", move |cx| {
        hand_off.resolve(cx.clone());
        Ok(())
    });
    assert_eq!(done.wait_timeout(WAIT), Some(TaskOutcome::Completed));

    let cx = context.wait_timeout(WAIT).expect("context handed off");
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    let wrapped = cx.with_spawned("late", move || flag.store(true, Ordering::SeqCst));
    assert!(matches!(
        wrapped.wait(),
        Err(LaneError::InvalidState { .. })
    ));
    assert!(!invoked.load(Ordering::SeqCst));
}

#[test]
fn default_lane_logs_through_tracing() {
    init_tracing();
    let scheduler = Scheduler::new("traced");
    let done = scheduler.submit("noisy", |cx| {
        cx.sleep(Duration::from_millis(1))?;
        Err(LaneError::body("reported via tracing"))
    });
    assert!(done.wait_timeout(WAIT).is_some_and(|o| o.is_failed()));
    scheduler.cancel_all();
    assert!(scheduler.wait_idle_timeout(WAIT));
}

#[test]
fn completion_signal_is_shareable() {
    let (scheduler, _) = lane("share");
    let done: Pending<TaskOutcome> = scheduler.submit("job", |_| Ok(()));
    let observer = done.clone();
    let watcher = thread::spawn(move || observer.wait());
    assert_eq!(done.wait_timeout(WAIT), Some(TaskOutcome::Completed));
    assert_eq!(watcher.join().expect("watcher thread"), TaskOutcome::Completed);
}
