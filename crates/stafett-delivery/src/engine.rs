//! Delivery engine orchestration for one subscription shard.
//!
//! Wires the shard's collaborators together and walks them through the
//! consumer lifecycle. `connect` opens one source per consumable queue
//! (retry tiers behind their redelivery delay) and one producer per
//! escalation target, then builds the shared scheduling components: the
//! concurrency limiter, the error-rate estimator, and the failure
//! throttler, with the estimator's threshold feeding the throttler through
//! a listener clamped to the configured floor. `start` kicks one
//! consumption loop per queue; `pause`/`resume` gate fetching without
//! dropping in-flight work; `close` tears everything down.
//!
//! The dead letter queue gets a producer but no loop: it is terminal and
//! only ever produced into.

use std::{collections::HashMap, fmt, sync::Arc};

use stafett_core::{models::InternalQueueType, time::Clock};
use tracing::{debug, info};

use crate::{
    client::{PushClient, PushResponse},
    config::ConsumerConfig,
    consumption::{ConsumptionLoop, DeliveryOutcome},
    context::{Context, EventExecutor},
    delayed::DelayedSource,
    error::{DeliveryError, Result},
    estimator::{ErrorRateEstimator, ListenerToken},
    limiter::ConcurrencyLimiter,
    ordering::GroupOrderingState,
    throttler::Throttler,
    transport::{MessageSource, Producer, TransportFactory},
};

/// Lifecycle state of a [`ConsumerEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed; transport not yet opened.
    Init,
    /// Transport open and components wired, loops not running.
    Connected,
    /// Loops fetching and delivering.
    Running,
    /// Loops alive but not fetching.
    Paused,
    /// Terminal; the engine cannot be restarted.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Init => "init",
            EngineState::Connected => "connected",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the engine's scheduling state.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    /// Current lifecycle state.
    pub state: EngineState,
    /// Fetched-but-unretired messages across all loops.
    pub in_flight_messages: usize,
    /// Push tasks currently running under the limiter.
    pub running_pushes: usize,
    /// Push tasks queued behind the concurrency cap.
    pub pending_pushes: usize,
    /// Failed deliveries waiting for an error-throttler permit.
    pub queued_failures: usize,
    /// Last error-handling rate cap computed by the estimator, per second.
    pub error_threshold_per_sec: f32,
    /// Failure permit budget per throttler window.
    pub failure_permit_budget: f32,
}

struct Wiring {
    estimator: Arc<ErrorRateEstimator>,
    throttler: Throttler<PushResponse>,
    limiter: ConcurrencyLimiter<DeliveryOutcome>,
    loops: Vec<Arc<ConsumptionLoop>>,
    listener_token: ListenerToken,
}

/// The consumer-side delivery engine for one subscription shard.
///
/// Lifecycle methods take `&mut self`: one owner drives the engine through
/// its states, and concurrent control is a caller-side concern.
pub struct ConsumerEngine {
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn TransportFactory>,
    client: Arc<dyn PushClient>,
    ordering: Arc<dyn GroupOrderingState>,

    context: Context,
    executor: Option<EventExecutor>,
    state: EngineState,
    wiring: Option<Wiring>,
}

impl ConsumerEngine {
    /// Creates an engine in the `Init` state and spawns its event context.
    pub fn new(
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn TransportFactory>,
        client: Arc<dyn PushClient>,
        ordering: Arc<dyn GroupOrderingState>,
    ) -> Self {
        let executor = EventExecutor::start();
        let context = executor.context();
        Self {
            config,
            clock,
            transport,
            client,
            ordering,
            context,
            executor: Some(executor),
            state: EngineState::Init,
            wiring: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Opens the transport and wires the scheduling components.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, on transport errors opening any
    /// source or producer, or when called in any state but `Init`.
    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_state(EngineState::Init, "connect")?;
        self.config.validate()?;

        let max_retry = self.config.max_retry_attempts;
        let priority = InternalQueueType::priority_order(max_retry);

        let mut sources: Vec<(InternalQueueType, Arc<dyn MessageSource>)> = Vec::new();
        sources.push((
            InternalQueueType::Main,
            self.transport.create_source(InternalQueueType::Main).await?,
        ));
        for attempt in 1..=max_retry {
            let queue = InternalQueueType::Retry(attempt);
            let raw = self.transport.create_source(queue).await?;
            let delayed = Arc::new(DelayedSource::new(
                raw,
                Arc::clone(&self.clock),
                self.config.retry_delivery_delay,
            ));
            sources.push((queue, delayed));
        }

        let mut producers: HashMap<InternalQueueType, Arc<dyn Producer>> = HashMap::new();
        for attempt in 1..=max_retry {
            let queue = InternalQueueType::Retry(attempt);
            producers.insert(queue, self.transport.create_producer(queue).await?);
        }
        producers.insert(
            InternalQueueType::DeadLetter,
            self.transport.create_producer(InternalQueueType::DeadLetter).await?,
        );
        let producers = Arc::new(producers);

        let limiter =
            ConcurrencyLimiter::new(self.context.clone(), self.config.max_concurrency, &priority);
        let estimator = Arc::new(ErrorRateEstimator::new(
            Arc::clone(&self.clock),
            self.config.estimator_window,
            self.config.estimator_tick,
            self.config.pct_error_threshold,
        )?);
        let throttler = Throttler::new(
            Arc::clone(&self.clock),
            self.config.throttler_window,
            self.config.throttler_tick,
            self.config.initial_threshold_per_sec,
            &priority,
        )?;

        let floor = self.config.threshold_floor;
        let listener_target = throttler.clone();
        let listener_token = estimator.add_listener(move |threshold| {
            debug!(threshold, "error threshold changed");
            listener_target.on_threshold_change(threshold.max(floor));
        });

        let loops = sources
            .into_iter()
            .map(|(queue_type, source)| {
                Arc::new(ConsumptionLoop::new(
                    queue_type,
                    self.context.clone(),
                    source,
                    Arc::clone(&self.client),
                    Arc::clone(&producers),
                    Arc::clone(&self.ordering),
                    limiter.clone(),
                    throttler.clone(),
                    Arc::clone(&estimator),
                    Arc::clone(&self.clock),
                    self.config.clone(),
                ))
            })
            .collect::<Vec<_>>();

        self.wiring = Some(Wiring { estimator, throttler, limiter, loops, listener_token });
        self.state = EngineState::Connected;
        info!(queues = 1 + usize::from(max_retry), "engine connected");
        Ok(())
    }

    /// Starts the estimator, the throttler, and one loop per queue.
    ///
    /// # Errors
    ///
    /// Fails unless the engine is `Connected`.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_state(EngineState::Connected, "start")?;
        let Some(wiring) = self.wiring.as_ref() else {
            return Err(DeliveryError::internal("engine connected without wiring"));
        };

        wiring.estimator.start();
        wiring.throttler.start();
        for consumption_loop in &wiring.loops {
            consumption_loop.start();
        }

        self.state = EngineState::Running;
        info!("engine started");
        Ok(())
    }

    /// Suspends fetching on every loop. In-flight messages keep draining.
    ///
    /// # Errors
    ///
    /// Fails unless the engine is `Running`.
    pub fn pause(&mut self) -> Result<()> {
        self.ensure_state(EngineState::Running, "pause")?;
        if let Some(wiring) = self.wiring.as_ref() {
            for consumption_loop in &wiring.loops {
                consumption_loop.pause();
            }
        }
        self.state = EngineState::Paused;
        Ok(())
    }

    /// Resumes fetching after [`ConsumerEngine::pause`].
    ///
    /// # Errors
    ///
    /// Fails unless the engine is `Paused`.
    pub fn resume(&mut self) -> Result<()> {
        self.ensure_state(EngineState::Paused, "resume")?;
        if let Some(wiring) = self.wiring.as_ref() {
            for consumption_loop in &wiring.loops {
                consumption_loop.resume();
            }
        }
        self.state = EngineState::Running;
        Ok(())
    }

    /// Stops the engine: loops stop fetching, the estimator and throttler
    /// timers stop, and the event context drains and shuts down.
    ///
    /// Idempotent. Messages still in flight are not waited for.
    pub async fn close(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }
        self.state = EngineState::Stopped;

        if let Some(wiring) = self.wiring.take() {
            for consumption_loop in &wiring.loops {
                consumption_loop.stop();
            }
            wiring.estimator.remove_listener(wiring.listener_token);
            wiring.estimator.close();
            wiring.throttler.close();
        }

        if let Some(executor) = self.executor.take() {
            executor.stop().await;
        }
        info!("engine stopped");
    }

    /// Snapshot of the engine's scheduling state.
    pub fn stats(&self) -> EngineStats {
        match self.wiring.as_ref() {
            Some(wiring) => EngineStats {
                state: self.state,
                in_flight_messages: wiring
                    .loops
                    .iter()
                    .map(|consumption_loop| consumption_loop.in_flight())
                    .sum(),
                running_pushes: wiring.limiter.running_count(),
                pending_pushes: wiring.limiter.pending_count(),
                queued_failures: wiring.throttler.queued_tasks(),
                error_threshold_per_sec: wiring.estimator.threshold(),
                failure_permit_budget: wiring.throttler.permit_budget(),
            },
            None => EngineStats {
                state: self.state,
                in_flight_messages: 0,
                running_pushes: 0,
                pending_pushes: 0,
                queued_failures: 0,
                error_threshold_per_sec: 0.0,
                failure_permit_budget: 0.0,
            },
        }
    }

    fn ensure_state(&self, expected: EngineState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(DeliveryError::invalid_state(operation, self.state.to_string()));
        }
        Ok(())
    }
}
