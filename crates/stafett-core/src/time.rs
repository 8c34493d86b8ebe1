//! Clock abstraction for time-driven engine components.
//!
//! The tick windows, delayed retry sources, and produce-retry backoff all
//! measure time through [`Clock`] so tests can drive them deterministically.
//! Production code uses [`RealClock`]; tests inject [`TestClock`] and advance
//! virtual time by hand.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Time source for duration measurement, wall-clock timestamps, and async
/// sleeps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for duration measurements (tick arithmetic).
    fn now(&self) -> Instant;

    /// Current wall-clock time (message produce timestamps).
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    ///
    /// Maps to `tokio::time::sleep` in production; a test clock advances its
    /// virtual time immediately instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Monotonic and wall-clock time start together and advance together through
/// [`TestClock::advance`]. Clones share the same underlying time, so a test
/// can hand one clone to the engine and keep another to steer it.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Virtual monotonic nanoseconds since construction.
    monotonic_ns: Arc<AtomicU64>,
    /// Virtual wall-clock nanoseconds since `UNIX_EPOCH`.
    system_ns: Arc<AtomicU64>,
    /// Anchor for converting virtual nanoseconds into `Instant`s.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock whose wall clock starts at the current system
    /// time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock whose wall clock starts at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(
                u64::try_from(since_epoch.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0),
            )),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by `duration`.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0);

        self.monotonic_ns.fetch_add(duration_ns, Ordering::AcqRel);
        self.system_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Elapsed virtual time since construction.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        let elapsed_ns = self.monotonic_ns.load(Ordering::Acquire);
        self.base_instant + Duration::from_nanos(elapsed_ns)
    }

    fn now_system(&self) -> SystemTime {
        let ns = self.system_ns.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_nanos(ns)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        // Yield so other tasks observe the new time before we resume.
        Box::pin(tokio::task::yield_now())
    }
}
