//! Bounded-parallelism, priority-ordered task scheduling.
//!
//! The limiter accepts batches of deferred push tasks tagged with the queue
//! type they came from, runs at most `max_concurrency` of them at once, and
//! parks the rest in per-type FIFOs scanned in the shard's priority order.
//! Queue state is owned by the shard's execution context; completions arrive
//! on arbitrary runtime threads and only touch atomics, requesting the next
//! scheduling pass through the context rather than running it in place.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use stafett_core::models::InternalQueueType;
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::Context;

/// Future produced by a deferred task once it is launched.
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A deferred unit of work: invoked at launch time, yields the future that
/// produces its result.
pub type TaskFn<T> = Box<dyn FnOnce() -> TaskFuture<T> + Send>;

struct QueuedTask<T> {
    task: TaskFn<T>,
    promise: oneshot::Sender<T>,
}

struct TaskQueue<T> {
    queue_type: InternalQueueType,
    tasks: Mutex<VecDeque<QueuedTask<T>>>,
}

/// Priority-aware scheduler bounding concurrently running tasks.
///
/// Cheap to clone; clones share the same queues and counters. Queue
/// mutations (`enqueue_tasks`, `execute_pending_tasks`) must happen on the
/// owning execution context; the completion path is thread-safe.
pub struct ConcurrencyLimiter<T> {
    inner: Arc<LimiterInner<T>>,
}

impl<T> Clone for ConcurrencyLimiter<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct LimiterInner<T> {
    context: Context,
    max_concurrency: usize,
    running: AtomicUsize,
    pending: AtomicUsize,
    /// Single-flight guard for scheduling passes: 0 means none pending. A
    /// completion that finds one already pending still forces another when
    /// it just brought `running` to zero, so queued work is never stranded
    /// behind the last completion.
    scheduled_passes: AtomicUsize,
    queues: Vec<TaskQueue<T>>,
}

impl<T: Send + 'static> ConcurrencyLimiter<T> {
    /// Creates a limiter over the given priority order.
    ///
    /// `priority_order` is scanned front to back on every pass; build it
    /// with [`InternalQueueType::priority_order`].
    pub fn new(
        context: Context,
        max_concurrency: usize,
        priority_order: &[InternalQueueType],
    ) -> Self {
        let queues = priority_order
            .iter()
            .map(|queue_type| TaskQueue { queue_type: *queue_type, tasks: Mutex::new(VecDeque::new()) })
            .collect();

        Self {
            inner: Arc::new(LimiterInner {
                context,
                max_concurrency,
                running: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                scheduled_passes: AtomicUsize::new(0),
                queues,
            }),
        }
    }

    /// Submits a batch for `queue_type`, returning one result future per
    /// task.
    ///
    /// Pending work is drained first; the new tasks then launch in input
    /// order while capacity remains and the remainder queues. Must be called
    /// on the owning execution context.
    ///
    /// # Panics
    ///
    /// Panics if `queue_type` is not part of this limiter's priority order;
    /// submitting for an unregistered queue is a programming error.
    pub fn enqueue_tasks(
        &self,
        queue_type: InternalQueueType,
        tasks: Vec<TaskFn<T>>,
    ) -> Vec<oneshot::Receiver<T>> {
        self.inner.execute_pending();

        let queue = self.inner.queue_for(queue_type);
        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (promise, receiver) = oneshot::channel();
            let queued = QueuedTask { task, promise };
            if self.inner.running.load(Ordering::Acquire) < self.inner.max_concurrency {
                self.inner.launch(queued);
            } else {
                queue.tasks.lock().unwrap_or_else(|e| e.into_inner()).push_back(queued);
                self.inner.pending.fetch_add(1, Ordering::AcqRel);
            }
            receivers.push(receiver);
        }
        receivers
    }

    /// Drains queued tasks in priority order while capacity remains.
    /// Idempotent; must be called on the owning execution context.
    pub fn execute_pending_tasks(&self) {
        self.inner.execute_pending();
    }

    /// Number of queued (not yet launched) tasks.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Number of currently running tasks.
    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Configured parallelism bound.
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }
}

impl<T: Send + 'static> LimiterInner<T> {
    fn queue_for(&self, queue_type: InternalQueueType) -> &TaskQueue<T> {
        self.queues
            .iter()
            .find(|queue| queue.queue_type == queue_type)
            .unwrap_or_else(|| panic!("no queue registered for type {queue_type}"))
    }

    fn execute_pending(self: &Arc<Self>) {
        for queue in &self.queues {
            loop {
                if self.running.load(Ordering::Acquire) >= self.max_concurrency {
                    return;
                }
                let next = queue.tasks.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                let Some(queued) = next else { break };
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.launch(queued);
            }
        }
    }

    /// Starts a task: the thunk runs here (on the context), its future is
    /// driven on the runtime, and the completion reports back from whatever
    /// thread finished it.
    fn launch(self: &Arc<Self>, queued: QueuedTask<T>) {
        self.running.fetch_add(1, Ordering::AcqRel);
        let QueuedTask { task, promise } = queued;
        let future = task();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = future.await;
            let _ = promise.send(result);
            inner.on_task_completion();
        });
    }

    fn on_task_completion(self: &Arc<Self>) {
        let now_running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;

        let mut schedule_pass =
            self.scheduled_passes.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok();
        if !schedule_pass && now_running == 0 {
            self.scheduled_passes.fetch_add(1, Ordering::AcqRel);
            schedule_pass = true;
        }

        if schedule_pass {
            debug!(running = now_running, "scheduling pass requested");
            let inner = Arc::clone(self);
            self.context.run_on_context(move || {
                inner.execute_pending();
                inner.scheduled_passes.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::context::EventExecutor;

    fn blocked_task(release: oneshot::Receiver<()>, value: u32) -> TaskFn<u32> {
        Box::new(move || {
            Box::pin(async move {
                let _ = release.await;
                value
            })
        })
    }

    fn immediate_task(value: u32) -> TaskFn<u32> {
        Box::new(move || Box::pin(async move { value }))
    }

    #[tokio::test]
    async fn batch_larger_than_capacity_queues_the_remainder() {
        let executor = EventExecutor::start();
        let limiter = ConcurrencyLimiter::new(
            executor.context(),
            2,
            &InternalQueueType::priority_order(1),
        );

        let mut releases = Vec::new();
        let mut tasks: Vec<TaskFn<u32>> = Vec::new();
        for value in 0..5 {
            let (tx, rx) = oneshot::channel();
            releases.push(tx);
            tasks.push(blocked_task(rx, value));
        }

        let receivers = limiter.enqueue_tasks(InternalQueueType::Main, tasks);
        assert_eq!(receivers.len(), 5);
        assert_eq!(limiter.running_count(), 2);
        assert_eq!(limiter.pending_count(), 3);

        for release in releases {
            let _ = release.send(());
        }
        for receiver in receivers {
            receiver.await.expect("task completes");
        }

        executor.stop().await;
    }

    #[tokio::test]
    async fn completed_tasks_resolve_their_own_futures() {
        let executor = EventExecutor::start();
        let limiter = ConcurrencyLimiter::new(
            executor.context(),
            4,
            &InternalQueueType::priority_order(1),
        );

        let receivers = limiter.enqueue_tasks(
            InternalQueueType::Main,
            vec![immediate_task(7), immediate_task(11)],
        );

        let mut results = Vec::new();
        for receiver in receivers {
            results.push(receiver.await.expect("task completes"));
        }
        assert_eq!(results, vec![7, 11]);

        executor.stop().await;
    }

    #[tokio::test]
    #[should_panic(expected = "no queue registered")]
    async fn unknown_queue_type_is_a_fault() {
        let executor = EventExecutor::start();
        let limiter: ConcurrencyLimiter<u32> = ConcurrencyLimiter::new(
            executor.context(),
            2,
            &InternalQueueType::priority_order(1),
        );

        let _ = limiter.enqueue_tasks(InternalQueueType::DeadLetter, vec![immediate_task(1)]);
    }
}
