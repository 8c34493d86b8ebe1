//! Circular tick buffer backing the sliding windows.
//!
//! Both the error-rate estimator and the failure throttler count events per
//! tick in a fixed ring of atomic counters spanning two window lengths: the
//! previous window's counts stay readable while the current window fills, so
//! a slide only touches the ticks that actually expired. Nothing stores raw
//! events and memory stays constant regardless of rate.
//!
//! Ticks are numbered from the window's construction instant and kept
//! signed: the first window begin sits `ticks_in_window` before tick zero,
//! and slot lookup uses the euclidean remainder so negative ticks index
//! cleanly.

use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use stafett_core::time::Clock;

use crate::error::{DeliveryError, Result};

/// Sliding event-count window over fixed-duration ticks.
///
/// `record` is callable from any thread. `slide` folds expired ticks into the
/// accumulated total and is expected to run from one driver at a time (the
/// owning component's timer pass); the counters themselves stay consistent
/// regardless.
pub struct TickWindow {
    clock: Arc<dyn Clock>,
    origin: Instant,
    tick_ms: u64,
    ticks_in_window: i64,
    /// Ring of per-tick counters, `2 * ticks_in_window` long.
    slots: Box<[AtomicU64]>,
    /// First tick of the window as of the last slide.
    window_begin_tick: AtomicI64,
    /// Sum of the counters in `[window_begin_tick, window_begin_tick +
    /// ticks_in_window)` as of the last slide.
    accumulated: AtomicI64,
}

impl TickWindow {
    /// Creates a window of `window` duration with `tick` granularity.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidWindow`] unless `window` is a positive
    /// integer multiple of a positive `tick`.
    pub fn new(clock: Arc<dyn Clock>, window: Duration, tick: Duration) -> Result<Self> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);

        if tick_ms == 0 || window_ms == 0 || window_ms % tick_ms != 0 {
            return Err(DeliveryError::invalid_window(window_ms, tick_ms));
        }

        let ticks_in_window = (window_ms / tick_ms) as i64;
        let slot_count = (2 * ticks_in_window) as usize;
        let slots =
            (0..slot_count).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice();
        let origin = clock.now();

        Ok(Self {
            clock,
            origin,
            tick_ms,
            ticks_in_window,
            slots,
            window_begin_tick: AtomicI64::new(-ticks_in_window),
            accumulated: AtomicI64::new(0),
        })
    }

    /// Tick number of the current instant.
    pub fn current_tick(&self) -> i64 {
        (self.elapsed_ms() / self.tick_ms) as i64
    }

    /// Adds `count` events to the current tick.
    pub fn record(&self, count: u64) {
        let tick = self.current_tick();
        self.slots[self.slot_index(tick)].fetch_add(count, Ordering::AcqRel);
    }

    /// Adds `count` events to a specific tick, previously obtained from
    /// [`TickWindow::current_tick`] by a scheduling pass that pins its tick
    /// for the whole pass.
    pub(crate) fn record_at(&self, tick: i64, count: u64) {
        self.slots[self.slot_index(tick)].fetch_add(count, Ordering::AcqRel);
    }

    /// Slides the window forward to the current instant.
    ///
    /// Every tick between the old and new window begin leaves the window:
    /// its counter is read-and-zeroed and subtracted from the accumulated
    /// total, while the tick one window ahead of it (newly inside) is added.
    /// Returns whether the window actually moved.
    pub fn slide(&self) -> bool {
        let new_begin = self.current_tick() - self.ticks_in_window;
        let old_begin = self.window_begin_tick.load(Ordering::Acquire);
        if new_begin <= old_begin {
            return false;
        }

        let mut delta = 0i64;
        for tick in old_begin..new_begin {
            let leaving = self.slots[self.slot_index(tick)].swap(0, Ordering::AcqRel);
            let entering =
                self.slots[self.slot_index(tick + self.ticks_in_window)].load(Ordering::Acquire);
            delta += entering as i64 - leaving as i64;
        }

        self.accumulated.fetch_add(delta, Ordering::AcqRel);
        self.window_begin_tick.store(new_begin, Ordering::Release);
        true
    }

    /// Accumulated event count of the window as of the last slide.
    pub fn total(&self) -> i64 {
        self.accumulated.load(Ordering::Acquire)
    }

    /// Event count at the current instant, interpolated within the current
    /// tick.
    ///
    /// The oldest tick's contribution is scaled down by the fraction of the
    /// current tick already elapsed and the current (still accumulating)
    /// tick is added, so the value moves smoothly instead of jumping at tick
    /// boundaries.
    pub fn interpolated_total(&self) -> f32 {
        let now_ms = self.elapsed_ms();
        let current = (now_ms / self.tick_ms) as i64;
        let factor = (now_ms % self.tick_ms) as f32 / self.tick_ms as f32;

        let begin = self.window_begin_tick.load(Ordering::Acquire);
        let oldest = self.slots[self.slot_index(begin)].load(Ordering::Acquire) as f32;
        let current_value = self.slots[self.slot_index(current)].load(Ordering::Acquire) as f32;

        self.total() as f32 - factor * oldest + current_value
    }

    /// Number of ticks in one window.
    pub fn ticks_in_window(&self) -> i64 {
        self.ticks_in_window
    }

    /// Duration of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Window span in seconds.
    pub fn window_seconds(&self) -> f32 {
        (self.ticks_in_window as f32 * self.tick_ms as f32) / 1000.0
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.clock.now().duration_since(self.origin).as_millis())
            .unwrap_or(u64::MAX)
    }

    fn slot_index(&self, tick: i64) -> usize {
        tick.rem_euclid(self.slots.len() as i64) as usize
    }
}
