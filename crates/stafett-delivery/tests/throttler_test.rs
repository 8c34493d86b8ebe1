//! Integration tests for the failure throttler.
//!
//! The in-module tests cover whole-window admission; these pin down the
//! interpolated behavior inside a tick, the window rescaling, and the
//! background pass driven by the timer.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use stafett_core::{models::InternalQueueType, time::TestClock};
use stafett_delivery::{limiter::TaskFuture, testkit::wait_until, throttler::Throttler};

fn throttler_with(
    clock: &TestClock,
    window_ms: u64,
    tick_ms: u64,
    per_sec: f32,
) -> Throttler<()> {
    Throttler::new(
        Arc::new(clock.clone()),
        Duration::from_millis(window_ms),
        Duration::from_millis(tick_ms),
        per_sec,
        &InternalQueueType::priority_order(1),
    )
    .expect("valid throttler geometry")
}

fn tracked_task(ran: &Arc<AtomicBool>) -> impl FnOnce() -> TaskFuture<()> + Send + 'static {
    let ran = Arc::clone(ran);
    move || {
        ran.store(true, Ordering::SeqCst);
        Box::pin(async {}) as TaskFuture<()>
    }
}

/// Spent permits decay linearly within the tick that expires them: a task
/// blocked at the exact window boundary is admitted halfway into the next
/// tick, without waiting for the full tick to close.
#[tokio::test]
async fn interpolated_decay_admits_mid_tick() {
    let clock = TestClock::new();
    let t = throttler_with(&clock, 1000, 100, 5.0);

    let first = Arc::new(AtomicBool::new(false));
    let second = Arc::new(AtomicBool::new(false));

    let _rx1 = t.acquire(InternalQueueType::Main, tracked_task(&first), 3);
    t.execute_pending_tasks();
    assert!(first.load(Ordering::SeqCst));

    // 4 > the 2 permits left: one rounded-up slice of 3 is consumed now,
    // leaving the task owing a single permit.
    let _rx2 = t.acquire(InternalQueueType::Main, tracked_task(&second), 4);
    t.execute_pending_tasks();
    assert!(!second.load(Ordering::SeqCst));
    assert!((t.permits_consumed() - 6.0).abs() < f32::EPSILON);

    // At the window boundary every spent permit still counts in full.
    clock.advance(Duration::from_millis(1000));
    t.execute_pending_tasks();
    assert!(!second.load(Ordering::SeqCst), "boundary leaves no free budget");

    // Halfway into the expiring tick only 3 of the 6 permits remain, which
    // frees enough budget for the single owed permit.
    clock.advance(Duration::from_millis(50));
    t.execute_pending_tasks();
    assert!(second.load(Ordering::SeqCst));
    assert_eq!(t.queued_tasks(), 0);
}

/// Threshold changes rescale to the window span, not to one second.
#[tokio::test]
async fn rescaling_accounts_for_window_span() {
    let clock = TestClock::new();
    let t = throttler_with(&clock, 2000, 100, 1.0);
    assert!((t.permit_budget() - 2.0).abs() < f32::EPSILON);

    t.on_threshold_change(3.0);
    assert!((t.permit_budget() - 6.0).abs() < f32::EPSILON);
}

/// Dropping the throttler with tasks still queued resolves their futures
/// with an error instead of leaving callers hanging.
#[tokio::test]
async fn teardown_fails_queued_acquisitions() {
    let clock = TestClock::new();
    let t = throttler_with(&clock, 1000, 100, 0.0);

    let ran = Arc::new(AtomicBool::new(false));
    let rx = t.acquire(InternalQueueType::Main, tracked_task(&ran), 1);

    t.execute_pending_tasks();
    assert!(!ran.load(Ordering::SeqCst), "zero budget admits nothing");

    drop(t);
    assert!(rx.await.is_err());
    assert!(!ran.load(Ordering::SeqCst));
}

/// The background timer admits queued tasks without anyone calling the
/// pass by hand.
#[tokio::test]
async fn background_pass_admits_on_its_own() {
    let clock = TestClock::new();
    let t = throttler_with(&clock, 1000, 100, 5.0);
    t.start();

    let ran = Arc::new(AtomicBool::new(false));
    let _rx = t.acquire(InternalQueueType::Main, tracked_task(&ran), 1);

    let observed = {
        let ran = Arc::clone(&ran);
        wait_until(Duration::from_secs(2), move || ran.load(Ordering::SeqCst)).await
    };
    assert!(observed, "timer never admitted the task");

    t.close();
}
