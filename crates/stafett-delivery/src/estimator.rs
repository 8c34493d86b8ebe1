//! Sliding-window error-rate estimation.
//!
//! Every completed push attempt is marked here. The estimator slides its
//! window twice per tick, recomputes the absolute rate cap (a configured
//! percentage of the window's attempt throughput), and publishes the new
//! value to registered listeners, in practice the throttler, which rescales
//! it into a per-window permit budget. A destination that starts failing
//! therefore has its failure-handling bandwidth tied to how much traffic it
//! actually sees.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use stafett_core::time::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::Result, window::TickWindow};

/// Callback invoked with each newly published threshold.
pub type ThresholdListener = Box<dyn Fn(f32) + Send + Sync>;

/// Handle returned by [`ErrorRateEstimator::add_listener`], used to
/// unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

/// Estimates the allowed failure-handling rate from recent push throughput.
pub struct ErrorRateEstimator {
    window: TickWindow,
    pct_error_threshold: f32,
    listeners: Mutex<Vec<(ListenerToken, ThresholdListener)>>,
    next_token: Mutex<u64>,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl ErrorRateEstimator {
    /// Creates an estimator over `window`/`tick` publishing
    /// `pct_error_threshold` percent of window throughput.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeliveryError::InvalidWindow`] unless the window is a
    /// positive multiple of the tick.
    pub fn new(
        clock: Arc<dyn Clock>,
        window: Duration,
        tick: Duration,
        pct_error_threshold: f32,
    ) -> Result<Self> {
        let window = TickWindow::new(Arc::clone(&clock), window, tick)?;
        Ok(Self {
            window,
            pct_error_threshold,
            listeners: Mutex::new(Vec::new()),
            next_token: Mutex::new(0),
            shutdown: CancellationToken::new(),
            ticker: Mutex::new(None),
            clock,
        })
    }

    /// Records one datapoint against the current tick. Callable from any
    /// thread.
    pub fn mark(&self) {
        self.window.record(1);
    }

    /// Current absolute rate cap in events per second:
    /// `window_total * (pct / 100) / window_seconds`.
    pub fn threshold(&self) -> f32 {
        self.window.total() as f32 * (self.pct_error_threshold / 100.0)
            / self.window.window_seconds()
    }

    /// Registers a listener invoked with the new threshold whenever a slide
    /// changes the window total.
    pub fn add_listener(&self, listener: impl Fn(f32) + Send + Sync + 'static) -> ListenerToken {
        let mut next = self.next_token.lock().unwrap_or_else(|e| e.into_inner());
        let token = ListenerToken(*next);
        *next += 1;
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((token, Box::new(listener)));
        token
    }

    /// Unregisters a listener. Returns whether it was registered.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != token);
        listeners.len() != before
    }

    /// Slides the window to the current instant and publishes the threshold
    /// if the accumulated total changed. Returns whether the window moved.
    ///
    /// Driven by the background timer; tests call it directly against a test
    /// clock.
    pub fn move_window(&self) -> bool {
        let before = self.window.total();
        if !self.window.slide() {
            return false;
        }

        let after = self.window.total();
        if after != before {
            let threshold = self.threshold();
            debug!(threshold, datapoints = after, "error-rate threshold updated");
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            for (_, listener) in listeners.iter() {
                listener(threshold);
            }
        }
        true
    }

    /// Spawns the periodic slide at twice the tick rate, so a tick boundary
    /// is never missed.
    pub fn start(self: &Arc<Self>) {
        let half_tick = self.window.tick_duration() / 2;
        let estimator = Arc::clone(self);
        let token = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = estimator.clock.sleep(half_tick) => estimator.move_window_and_discard(),
                    () = token.cancelled() => break,
                }
            }
        });
        *self.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stops the periodic slide.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    fn move_window_and_discard(&self) {
        let _ = self.move_window();
    }
}

impl Drop for ErrorRateEstimator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use stafett_core::time::TestClock;

    use super::*;

    fn estimator(clock: &TestClock, window_ms: u64, tick_ms: u64, pct: f32) -> ErrorRateEstimator {
        ErrorRateEstimator::new(
            Arc::new(clock.clone()),
            Duration::from_millis(window_ms),
            Duration::from_millis(tick_ms),
            pct,
        )
        .expect("valid estimator geometry")
    }

    #[test]
    fn rejects_misaligned_window() {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let result = ErrorRateEstimator::new(
            clock,
            Duration::from_millis(2500),
            Duration::from_millis(1000),
            10.0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn threshold_is_percentage_of_window_throughput() {
        let clock = TestClock::new();
        let est = estimator(&clock, 2000, 1000, 10.0);

        for _ in 0..5 {
            est.mark();
        }
        clock.advance(Duration::from_millis(1000));
        for _ in 0..15 {
            est.mark();
        }
        clock.advance(Duration::from_millis(1000));

        assert!(est.move_window());
        // 20 datapoints, 10% of them, over a 2s window.
        assert!((est.threshold() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn listeners_fire_only_when_the_total_changes() {
        let clock = TestClock::new();
        let est = estimator(&clock, 2000, 1000, 10.0);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        est.add_listener(move |threshold| sink.lock().unwrap().push(threshold));

        est.mark();
        clock.advance(Duration::from_millis(2000));
        assert!(est.move_window());

        // Second slide over an empty stretch still changes the total (1 -> 0);
        // the one after that has nothing left to change.
        clock.advance(Duration::from_millis(2000));
        assert!(est.move_window());
        clock.advance(Duration::from_millis(2000));
        assert!(est.move_window());

        let seen = published.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0] > 0.0);
        assert!((seen[1] - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn threshold_grows_with_sustained_marking() {
        let clock = TestClock::new();
        let est = estimator(&clock, 10_000, 1000, 50.0);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        est.add_listener(move |threshold| sink.lock().unwrap().push(threshold));

        // 100 marks per second; the 10s window keeps absorbing them, so the
        // published cap climbs 5 per second up to 50.
        for _ in 0..10 {
            for _ in 0..100 {
                est.mark();
            }
            clock.advance(Duration::from_millis(1000));
            est.move_window();
        }

        let seen = published.lock().unwrap().clone();
        let expected: Vec<f32> = (1..=10).map(|s| s as f32 * 5.0).collect();
        assert_eq!(seen, expected);

        // Steady state: same in, same out, no publication.
        for _ in 0..100 {
            est.mark();
        }
        clock.advance(Duration::from_millis(1000));
        est.move_window();
        assert_eq!(published.lock().unwrap().len(), 10);
    }

    #[test]
    fn removed_listeners_stay_silent() {
        let clock = TestClock::new();
        let est = estimator(&clock, 2000, 1000, 10.0);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let token = est.add_listener(move |threshold| sink.lock().unwrap().push(threshold));

        assert!(est.remove_listener(token));
        assert!(!est.remove_listener(token));

        est.mark();
        clock.advance(Duration::from_millis(2000));
        est.move_window();

        assert!(published.lock().unwrap().is_empty());
    }
}
