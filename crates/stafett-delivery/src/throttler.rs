//! Adaptive sliding-window permit throttling.
//!
//! Failed pushes do not proceed straight to escalation: each one first
//! acquires permits here, and the permit budget is a sliding-window quota
//! retuned by the error-rate estimator. Queues are scanned in the shard's
//! priority order, and a task too expensive for the remaining budget eats it
//! in rounded-up slices across consecutive passes instead of blocking
//! everything behind it.
//!
//! `acquire` only enqueues; admission happens on the periodic pass, which
//! runs at twice the tick rate and is guarded so overlapping passes skip
//! rather than stack.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use stafett_core::{models::InternalQueueType, time::Clock};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::Result,
    limiter::{TaskFn, TaskFuture},
    window::TickWindow,
};

struct PermitHolder<T> {
    task: TaskFn<T>,
    promise: oneshot::Sender<T>,
    /// Permits still owed before the task may run; partial passes whittle
    /// this down.
    pending_permits: u64,
}

struct PermitQueue<T> {
    queue_type: InternalQueueType,
    tasks: Mutex<VecDeque<PermitHolder<T>>>,
}

enum Served<T> {
    Full(PermitHolder<T>),
    Partial(u64),
    Empty,
}

/// Sliding-window permit scheduler for failure handling.
///
/// Cheap to clone; clones share queues, window, and budget.
pub struct Throttler<T> {
    inner: Arc<ThrottlerInner<T>>,
}

impl<T> Clone for Throttler<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct ThrottlerInner<T> {
    clock: Arc<dyn Clock>,
    window: TickWindow,
    /// Per-window permit budget, stored as `f32` bits.
    threshold_bits: AtomicU32,
    /// Pass guard: a periodic trigger arriving mid-pass is skipped.
    execution_in_progress: AtomicBool,
    queues: Vec<PermitQueue<T>>,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Throttler<T> {
    /// Creates a throttler over `window`/`tick` with queues in
    /// `priority_order` and an initial budget of `initial_threshold_per_sec`
    /// permits per second.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeliveryError::InvalidWindow`] unless the window is a
    /// positive multiple of the tick.
    pub fn new(
        clock: Arc<dyn Clock>,
        window: Duration,
        tick: Duration,
        initial_threshold_per_sec: f32,
        priority_order: &[InternalQueueType],
    ) -> Result<Self> {
        let window = TickWindow::new(Arc::clone(&clock), window, tick)?;
        let initial_budget = initial_threshold_per_sec * window.window_seconds();
        let queues = priority_order
            .iter()
            .map(|queue_type| PermitQueue {
                queue_type: *queue_type,
                tasks: Mutex::new(VecDeque::new()),
            })
            .collect();

        Ok(Self {
            inner: Arc::new(ThrottlerInner {
                clock,
                window,
                threshold_bits: AtomicU32::new(initial_budget.to_bits()),
                execution_in_progress: AtomicBool::new(false),
                queues,
                shutdown: CancellationToken::new(),
                ticker: Mutex::new(None),
            }),
        })
    }

    /// Enqueues `task` for `queue_type` with a cost of `permits`.
    ///
    /// The returned future resolves with the task's result once the budget
    /// admitted it; it errors only if the throttler shuts down with the task
    /// still queued. Admission happens on a pass, at most half a tick away.
    ///
    /// # Panics
    ///
    /// Panics if `queue_type` is not part of this throttler's priority
    /// order.
    pub fn acquire<F, Fut>(
        &self,
        queue_type: InternalQueueType,
        task: F,
        permits: u32,
    ) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (promise, receiver) = oneshot::channel();
        let holder = PermitHolder {
            task: Box::new(move || Box::pin(task()) as TaskFuture<T>),
            promise,
            pending_permits: u64::from(permits),
        };
        self.inner
            .queue_for(queue_type)
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(holder);
        receiver
    }

    /// Rescales a per-second rate into this window's permit budget.
    pub fn on_threshold_change(&self, rate_per_second: f32) {
        let budget = rate_per_second * self.inner.window.window_seconds();
        self.inner.threshold_bits.store(budget.to_bits(), Ordering::Release);
        debug!(rate_per_second, budget, "throttler budget rescaled");
    }

    /// Current per-window permit budget.
    pub fn permit_budget(&self) -> f32 {
        f32::from_bits(self.inner.threshold_bits.load(Ordering::Acquire))
    }

    /// Permits consumed against the current window, interpolated within the
    /// current tick.
    pub fn permits_consumed(&self) -> f32 {
        self.inner.window.interpolated_total()
    }

    /// Number of tasks waiting for budget across all queues.
    pub fn queued_tasks(&self) -> usize {
        self.inner
            .queues
            .iter()
            .map(|queue| queue.tasks.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Runs one admission pass unless another is already running.
    ///
    /// Driven by the background timer; tests call it directly against a test
    /// clock.
    pub fn execute_pending_tasks(&self) {
        if self
            .inner
            .execution_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("throttler pass already running, skipping trigger");
            return;
        }
        self.inner.run_pass();
        self.inner.execution_in_progress.store(false, Ordering::Release);
    }

    /// Spawns the periodic pass at twice the tick rate.
    pub fn start(&self) {
        let half_tick = self.inner.window.tick_duration() / 2;
        let throttler = self.clone();
        let token = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = throttler.inner.clock.sleep(half_tick) => throttler.execute_pending_tasks(),
                    () = token.cancelled() => break,
                }
            }
        });
        *self.inner.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stops the periodic pass. Tasks still queued observe a dropped
    /// promise when the throttler itself drops.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.ticker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl<T: Send + 'static> ThrottlerInner<T> {
    fn queue_for(&self, queue_type: InternalQueueType) -> &PermitQueue<T> {
        self.queues
            .iter()
            .find(|queue| queue.queue_type == queue_type)
            .unwrap_or_else(|| panic!("no throttler queue registered for type {queue_type}"))
    }

    fn run_pass(&self) {
        self.window.slide();
        let current_tick = self.window.current_tick();
        let budget = f32::from_bits(self.threshold_bits.load(Ordering::Acquire));
        let consumed = self.window.interpolated_total();
        let mut free = budget - consumed;

        debug!(budget, consumed, free, "throttler pass");
        if free <= 0.0 {
            return;
        }

        for queue in &self.queues {
            loop {
                if free <= 0.0 {
                    break;
                }

                let served = {
                    let mut tasks = queue.tasks.lock().unwrap_or_else(|e| e.into_inner());
                    match tasks.front_mut() {
                        None => Served::Empty,
                        Some(head) if head.pending_permits as f32 <= free => {
                            match tasks.pop_front() {
                                Some(holder) => Served::Full(holder),
                                None => Served::Empty,
                            }
                        },
                        Some(head) => {
                            // Rounded up: an oversized task is drained one
                            // whole permit past the fractional budget each
                            // pass.
                            let slice = free as u64 + 1;
                            head.pending_permits -= slice;
                            Served::Partial(slice)
                        },
                    }
                };

                match served {
                    Served::Empty => break,
                    Served::Full(holder) => {
                        let cost = holder.pending_permits;
                        self.window.record_at(current_tick, cost);
                        free -= cost as f32;
                        self.launch(holder);
                        debug!(queue = %queue.queue_type, cost, free, "throttled task admitted");
                    },
                    Served::Partial(slice) => {
                        self.window.record_at(current_tick, slice);
                        free -= slice as f32;
                        debug!(queue = %queue.queue_type, slice, "partial permit consumption");
                    },
                }
            }

            if free <= 0.0 {
                break;
            }
        }
    }

    fn launch(&self, holder: PermitHolder<T>) {
        let PermitHolder { task, promise, .. } = holder;
        let future = task();
        tokio::spawn(async move {
            let result = future.await;
            let _ = promise.send(result);
        });
    }
}

impl<T> Drop for ThrottlerInner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
