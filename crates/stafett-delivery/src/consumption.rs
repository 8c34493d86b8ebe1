//! The per-queue consumption loop.
//!
//! One loop drives one internal queue of a shard through three stages:
//! fetch a batch from the queue's source, squeeze the messages through the
//! concurrency limiter, and push each one to the subscriber. Failed pushes
//! wait on the error throttler before escalating into the next queue of the
//! retry ladder; grouped messages whose group already failed skip the push
//! and follow their group directly.
//!
//! Two places can buffer messages uncontrolled: the limiter when pushes are
//! slow, and failure handling when escalation produces are slow. The loop
//! therefore skips its next fetch while the number of unretired messages is
//! at the in-flight cap, and re-arms as completions bring it back under.
//!
//! Fetching and batch partitioning run on the shard's event context; push
//! completions and escalation chains run on the runtime's worker threads
//! and only touch atomics.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use stafett_core::{
    models::{ConsumptionStatus, InternalQueueType, MessagePointer, MessageTracker},
    time::Clock,
};
use tracing::{debug, error, info, warn};

use crate::{
    client::{PushClient, PushResponse},
    config::ConsumerConfig,
    context::Context,
    error::Result,
    estimator::ErrorRateEstimator,
    limiter::{ConcurrencyLimiter, TaskFn, TaskFuture},
    ordering::GroupOrderingState,
    throttler::Throttler,
    transport::{MessageSource, Producer},
};

/// Backoff before re-polling a queue whose fetch errored.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A finished push attempt flowing out of the limiter: the subscriber's
/// verdict plus the tracker that owns the message.
pub struct DeliveryOutcome {
    /// Subscriber verdict, already gated by the error throttler when it was
    /// a failure.
    pub response: PushResponse,
    /// Tracker for the pushed occurrence; still unretired.
    pub tracker: Box<dyn MessageTracker>,
}

/// Consumption loop for one internal queue.
///
/// Constructed by the engine with the shard-wide collaborators and driven
/// entirely by its own completions after [`ConsumptionLoop::start`].
pub struct ConsumptionLoop {
    queue_type: InternalQueueType,
    context: Context,
    source: Arc<dyn MessageSource>,
    client: Arc<dyn PushClient>,
    producers: Arc<HashMap<InternalQueueType, Arc<dyn Producer>>>,
    ordering: Arc<dyn GroupOrderingState>,
    limiter: ConcurrencyLimiter<DeliveryOutcome>,
    throttler: Throttler<PushResponse>,
    estimator: Arc<ErrorRateEstimator>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,

    in_flight: AtomicUsize,
    fetch_in_progress: AtomicBool,
    stop_requested: AtomicBool,
    paused: AtomicBool,
}

impl ConsumptionLoop {
    /// Creates the loop for `queue_type`. Collaborators are the shard-wide
    /// instances; `source` is this queue's own (retry tiers pass a delayed
    /// source).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_type: InternalQueueType,
        context: Context,
        source: Arc<dyn MessageSource>,
        client: Arc<dyn PushClient>,
        producers: Arc<HashMap<InternalQueueType, Arc<dyn Producer>>>,
        ordering: Arc<dyn GroupOrderingState>,
        limiter: ConcurrencyLimiter<DeliveryOutcome>,
        throttler: Throttler<PushResponse>,
        estimator: Arc<ErrorRateEstimator>,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue_type,
            context,
            source,
            client,
            producers,
            ordering,
            limiter,
            throttler,
            estimator,
            clock,
            config,
            in_flight: AtomicUsize::new(0),
            fetch_in_progress: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Queue this loop consumes from.
    pub fn queue_type(&self) -> InternalQueueType {
        self.queue_type
    }

    /// Fetched-but-unretired messages currently owned by this loop.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Kicks the first iteration.
    pub fn start(self: &Arc<Self>) {
        self.run_loop_if_required(self.in_flight());
    }

    /// Stops fetching. In-flight messages drain to completion; the loop
    /// never re-arms afterwards.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Suspends fetching without losing in-flight work.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        info!(queue = %self.queue_type, "consumption paused");
    }

    /// Resumes fetching after [`ConsumptionLoop::pause`].
    pub fn resume(self: &Arc<Self>) {
        self.paused.store(false, Ordering::Release);
        info!(queue = %self.queue_type, "consumption resumed");
        self.run_loop_if_required(self.in_flight());
    }

    /// Arms the next iteration unless the in-flight cap is reached or a
    /// fetch is already running. Callable from any thread; completions call
    /// this with the count they just observed.
    pub fn run_loop_if_required(self: &Arc<Self>, current_in_flight: usize) {
        if current_in_flight < self.config.max_in_flight_messages
            && self
                .fetch_in_progress
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(queue = %self.queue_type, in_flight = current_in_flight, "enqueuing next iteration");
            let this = Arc::clone(self);
            self.context.execute(move || this.iteration());
        } else {
            debug!(queue = %self.queue_type, in_flight = current_in_flight, "skipping next iteration");
        }
    }

    /// One iteration: fetch a batch, then hand it back to the context.
    /// Runs on the context; holds the fetch slot until the fetch resolves.
    fn iteration(self: &Arc<Self>) {
        if self.stop_requested.load(Ordering::Acquire) {
            info!(queue = %self.queue_type, "stop requested, not fetching messages");
            return;
        }
        if self.paused.load(Ordering::Acquire) {
            debug!(queue = %self.queue_type, "paused, releasing fetch slot");
            self.fetch_in_progress.store(false, Ordering::Release);
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let fetched = this.source.fetch_messages(this.config.batch_size).await;
            let context = this.context.clone();
            context.run_on_context(move || this.on_fetch_complete(fetched));
        });
    }

    fn on_fetch_complete(self: &Arc<Self>, fetched: Result<Vec<Box<dyn MessageTracker>>>) {
        match fetched {
            Ok(trackers) if trackers.is_empty() => {
                self.fetch_in_progress.store(false, Ordering::Release);
                self.schedule_kick(self.config.poll_interval);
            },
            Ok(trackers) => {
                let count = trackers.len();
                self.in_flight.fetch_add(count, Ordering::AcqRel);
                debug!(queue = %self.queue_type, count, "fetched messages for delivery");
                self.on_messages_fetched(trackers);
                self.fetch_in_progress.store(false, Ordering::Release);
                self.run_loop_if_required(self.in_flight());
            },
            Err(error) => {
                error!(queue = %self.queue_type, %error, "failed to fetch messages");
                self.fetch_in_progress.store(false, Ordering::Release);
                self.schedule_kick(FETCH_ERROR_BACKOFF);
            },
        }
    }

    /// Re-arms the loop after `delay`, off the context.
    fn schedule_kick(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.clock.sleep(delay).await;
            this.run_loop_if_required(this.in_flight());
        });
    }

    /// Partitions a fetched batch and starts delivery.
    ///
    /// Messages whose group already failed are forwarded straight into the
    /// group's failure queue; everything else goes through the limiter.
    fn on_messages_fetched(self: &Arc<Self>, trackers: Vec<Box<dyn MessageTracker>>) {
        let mut for_push = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            // A message consumed from the very queue its group is pinned to
            // sits at the group's failure frontier and gets a real attempt.
            let failed_into = tracker
                .message()
                .group_id
                .as_deref()
                .and_then(|group_id| self.ordering.pointer_for(group_id).failed_into())
                .filter(|target| *target != self.queue_type);
            match failed_into {
                Some(target) => {
                    debug!(
                        queue = %self.queue_type,
                        target = %target,
                        message_id = %tracker.message().id,
                        "group already failed, forwarding message"
                    );
                    self.escalate(target, tracker, ConsumptionStatus::GroupFailed);
                },
                None => for_push.push(tracker),
            }
        }

        if for_push.is_empty() {
            return;
        }
        for receiver in self.deliver_messages(for_push) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                match receiver.await {
                    Ok(outcome) if outcome.response.is_success() => this.on_success(outcome.tracker),
                    Ok(outcome) => this.on_push_failure(outcome.tracker),
                    Err(_) => debug!("delivery task dropped before completion"),
                }
            });
        }
    }

    /// Enqueues push tasks on the limiter and returns their completions.
    ///
    /// Each task marks the consume start when launched, pushes, records the
    /// attempt with the estimator, and on failure waits for an error-
    /// throttler permit before surfacing the verdict.
    fn deliver_messages(
        &self,
        trackers: Vec<Box<dyn MessageTracker>>,
    ) -> Vec<tokio::sync::oneshot::Receiver<DeliveryOutcome>> {
        let queue_type = self.queue_type;
        let tasks: Vec<TaskFn<DeliveryOutcome>> = trackers
            .into_iter()
            .map(|mut tracker| {
                let client = Arc::clone(&self.client);
                let estimator = Arc::clone(&self.estimator);
                let throttler = self.throttler.clone();
                Box::new(move || {
                    tracker.on_consume_start(queue_type);
                    Box::pin(async move {
                        let response = client.push(tracker.message()).await;
                        estimator.mark();
                        info!(
                            queue = %queue_type,
                            message_id = %tracker.message().id,
                            status = response.status_code,
                            "delivery attempt made"
                        );
                        let response = if response.is_success() {
                            response
                        } else {
                            let verdict = response.clone();
                            match throttler
                                .acquire(queue_type, move || async move { verdict }, 1)
                                .await
                            {
                                Ok(gated) => gated,
                                // Throttler torn down mid-flight; surface the
                                // verdict we already have.
                                Err(_) => response,
                            }
                        };
                        DeliveryOutcome { response, tracker }
                    }) as TaskFuture<DeliveryOutcome>
                }) as TaskFn<DeliveryOutcome>
            })
            .collect();
        self.limiter.enqueue_tasks(queue_type, tasks)
    }

    fn on_success(self: &Arc<Self>, tracker: Box<dyn MessageTracker>) {
        match tracker.message().group_id.clone() {
            Some(group_id) => {
                let consumed_from = MessagePointer::new(self.queue_type, tracker.offset());
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(error) =
                        this.ordering.message_consumed(&group_id, consumed_from).await
                    {
                        warn!(group = %group_id, %error, "failed to record group consumption");
                    }
                    this.complete(tracker, ConsumptionStatus::Sent);
                });
            },
            None => self.complete(tracker, ConsumptionStatus::Sent),
        }
    }

    fn on_push_failure(self: &Arc<Self>, tracker: Box<dyn MessageTracker>) {
        match self.queue_type.escalation_target(self.config.max_retry_attempts) {
            Some(target) => self.escalate(target, tracker, ConsumptionStatus::Failed),
            None => {
                error!(queue = %self.queue_type, "no escalation target from this queue");
                self.complete(tracker, ConsumptionStatus::Failed);
            },
        }
    }

    /// Moves a failed message into `target` and retires it with `status`.
    ///
    /// The produce is retried with jittered exponential backoff; a message
    /// whose escalation keeps failing is retired anyway so the loop never
    /// wedges on a single occurrence.
    fn escalate(
        self: &Arc<Self>,
        target: InternalQueueType,
        tracker: Box<dyn MessageTracker>,
        status: ConsumptionStatus,
    ) {
        let Some(producer) = self.producers.get(&target).cloned() else {
            error!(queue = %target, "no producer wired for escalation target");
            self.complete(tracker, status);
            return;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let message = tracker.message().clone();
            let consumed_from = MessagePointer::new(this.queue_type, tracker.offset());
            let mut attempt = 1;
            loop {
                match producer.produce(message.clone()).await {
                    Ok(offset) => {
                        debug!(
                            queue = %target,
                            offset = %offset,
                            message_id = %message.id,
                            "escalated message to internal queue"
                        );
                        if let Some(group_id) = &message.group_id {
                            let produced_to = MessagePointer::new(target, offset);
                            if let Err(error) = this
                                .ordering
                                .message_transitioned(group_id, consumed_from, target, produced_to)
                                .await
                            {
                                warn!(group = %group_id, %error, "failed to record group transition");
                            }
                        }
                        break;
                    },
                    Err(error) if attempt < this.config.produce_retry_attempts => {
                        warn!(
                            queue = %target,
                            message_id = %message.id,
                            attempt,
                            %error,
                            "escalation produce failed, retrying"
                        );
                        this.clock
                            .sleep(produce_backoff(this.config.produce_retry_base_delay, attempt))
                            .await;
                        attempt += 1;
                    },
                    Err(error) => {
                        error!(
                            queue = %target,
                            message_id = %message.id,
                            attempts = attempt,
                            %error,
                            "escalation produce failed, retiring message"
                        );
                        break;
                    },
                }
            }
            this.complete(tracker, status);
        });
    }

    /// Terminal bookkeeping for one message; callable from any thread.
    fn complete(self: &Arc<Self>, tracker: Box<dyn MessageTracker>, status: ConsumptionStatus) {
        info!(
            message_id = %tracker.message().id,
            status = %status,
            "message processing complete"
        );
        tracker.on_consumed(status);

        let remaining = self.in_flight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.run_loop_if_required(remaining);
    }
}

/// Exponential backoff for escalation produces: doubles per attempt with up
/// to 25% jitter on top.
fn produce_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(10));
    let jitter_cap = (exp.as_millis() as u64 / 4).max(1);
    let jitter = rand::rng().random_range(0..=jitter_cap);
    exp + Duration::from_millis(jitter)
}
