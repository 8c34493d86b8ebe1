//! End-to-end tests for the consumer engine.
//!
//! Drives a full engine against the in-memory transport: messages are
//! seeded into the main queue, pushed through the scripted client, and
//! followed down the escalation ladder by asserting on produced queues,
//! tracker statuses, and consume starts.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use stafett_core::{
    models::{ConsumptionStatus, InternalQueueType, Message, MessageId, MessagePointer, Offset},
    time::TestClock,
};
use stafett_delivery::{
    client::{PushClient, PushResponse},
    ordering::GroupOrderingState,
    testkit::{wait_until, InMemoryGroupState, InMemoryTransport, ScriptedPushClient},
    transport::TransportFactory,
    ConsumerConfig, ConsumerEngine, EngineState,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

struct Fixture {
    transport: Arc<InMemoryTransport>,
    client: Arc<ScriptedPushClient>,
    state: Arc<InMemoryGroupState>,
    engine: ConsumerEngine,
}

fn fixture(config: ConsumerConfig) -> Fixture {
    init_tracing();
    let transport = Arc::new(InMemoryTransport::new(config.max_retry_attempts));
    let client = Arc::new(ScriptedPushClient::new());
    let state = Arc::new(InMemoryGroupState::new());
    let engine = ConsumerEngine::new(
        config,
        Arc::new(TestClock::new()),
        Arc::clone(&transport) as Arc<dyn TransportFactory>,
        Arc::clone(&client) as Arc<dyn PushClient>,
        Arc::clone(&state) as Arc<dyn GroupOrderingState>,
    );
    Fixture { transport, client, state, engine }
}

fn payload(sequence: u32) -> String {
    serde_json::json!({ "event": "order.created", "sequence": sequence }).to_string()
}

fn statuses_of(transport: &InMemoryTransport, id: MessageId) -> Vec<ConsumptionStatus> {
    transport
        .statuses()
        .into_iter()
        .filter(|(logged, _)| *logged == id)
        .map(|(_, status)| status)
        .collect()
}

#[tokio::test]
async fn delivers_seeded_messages() -> Result<()> {
    let mut fx = fixture(ConsumerConfig::default());

    let messages: Vec<Message> =
        (0..3).map(|sequence| Message::new(payload(sequence), Utc::now())).collect();
    for message in &messages {
        fx.transport.seed(InternalQueueType::Main, message.clone());
    }

    fx.engine.connect().await?;
    fx.engine.start()?;

    let transport = Arc::clone(&fx.transport);
    assert!(wait_until(WAIT, move || transport.retired_count() == 3).await);

    for message in &messages {
        assert_eq!(statuses_of(&fx.transport, message.id), [ConsumptionStatus::Sent]);
        assert_eq!(fx.client.push_count(message.id), 1);
    }
    assert!(fx.transport.produced(InternalQueueType::Retry(1)).is_empty());
    assert!(fx
        .transport
        .consume_starts()
        .iter()
        .all(|(_, queue)| *queue == InternalQueueType::Main));

    fx.engine.close().await;
    Ok(())
}

#[tokio::test]
async fn failed_message_walks_the_full_ladder() -> Result<()> {
    let config = ConsumerConfig { max_retry_attempts: 2, ..ConsumerConfig::default() };
    let mut fx = fixture(config);

    let message = Message::new(payload(0), Utc::now());
    fx.client.fail_always(message.id);
    fx.transport.seed(InternalQueueType::Main, message.clone());

    fx.engine.connect().await?;
    fx.engine.start()?;

    let transport = Arc::clone(&fx.transport);
    assert!(
        wait_until(WAIT, move || {
            transport.produced(InternalQueueType::DeadLetter).len() == 1
                && transport.retired_count() == 3
        })
        .await
    );

    // One occurrence per rung: main, retry-1, retry-2, then dead letter.
    assert_eq!(fx.transport.produced(InternalQueueType::Retry(1)).len(), 1);
    assert_eq!(fx.transport.produced(InternalQueueType::Retry(2)).len(), 1);
    assert_eq!(fx.client.push_count(message.id), 3);
    assert_eq!(
        fx.transport
            .consume_starts()
            .iter()
            .map(|(_, queue)| *queue)
            .collect::<Vec<_>>(),
        [
            InternalQueueType::Main,
            InternalQueueType::Retry(1),
            InternalQueueType::Retry(2),
        ]
    );
    assert_eq!(statuses_of(&fx.transport, message.id), [
        ConsumptionStatus::Failed,
        ConsumptionStatus::Failed,
        ConsumptionStatus::Failed,
    ]);

    fx.engine.close().await;
    Ok(())
}

#[tokio::test]
async fn transient_failure_recovers_in_the_first_retry_tier() -> Result<()> {
    let mut fx = fixture(ConsumerConfig::default());

    let message = Message::new(payload(0), Utc::now());
    fx.client.fail_times(message.id, 1);
    fx.transport.seed(InternalQueueType::Main, message.clone());

    fx.engine.connect().await?;
    fx.engine.start()?;

    let transport = Arc::clone(&fx.transport);
    let id = message.id;
    assert!(
        wait_until(WAIT, move || {
            let statuses = transport.statuses();
            statuses.iter().any(|(logged, status)| {
                *logged == id && *status == ConsumptionStatus::Sent
            }) && statuses.len() == 2
        })
        .await
    );

    assert_eq!(statuses_of(&fx.transport, message.id), [
        ConsumptionStatus::Failed,
        ConsumptionStatus::Sent,
    ]);
    assert_eq!(fx.transport.produced(InternalQueueType::Retry(1)).len(), 1);
    assert!(fx.transport.produced(InternalQueueType::DeadLetter).is_empty());
    assert_eq!(fx.client.push_count(message.id), 2);

    fx.engine.close().await;
    Ok(())
}

#[tokio::test]
async fn group_failure_forwards_siblings_without_attempts() -> Result<()> {
    let mut fx = fixture(ConsumerConfig::default());

    // The group already has a failed message sitting in retry-1.
    fx.state
        .message_transitioned(
            "orders-42",
            MessagePointer::new(InternalQueueType::Main, Offset(0)),
            InternalQueueType::Retry(1),
            MessagePointer::new(InternalQueueType::Retry(1), Offset(0)),
        )
        .await?;

    let sibling = Message::new(payload(1), Utc::now()).with_group("orders-42");
    fx.transport.seed(InternalQueueType::Main, sibling.clone());

    fx.engine.connect().await?;
    fx.engine.start()?;

    let transport = Arc::clone(&fx.transport);
    let id = sibling.id;
    assert!(
        wait_until(WAIT, move || {
            statuses_of(&transport, id).contains(&ConsumptionStatus::Sent)
        })
        .await
    );

    // Forwarded from main without a push, then delivered from retry-1 where
    // it sat at the group's failure frontier.
    let statuses = statuses_of(&fx.transport, sibling.id);
    assert_eq!(statuses.len(), 2);
    assert!(statuses.contains(&ConsumptionStatus::GroupFailed));
    assert!(statuses.contains(&ConsumptionStatus::Sent));
    assert_eq!(fx.client.push_count(sibling.id), 1);
    assert_eq!(fx.transport.consume_starts(), [(sibling.id, InternalQueueType::Retry(1))]);
    assert_eq!(fx.transport.produced(InternalQueueType::Retry(1)).len(), 1);
    assert_eq!(fx.state.pinned_queue("orders-42"), None);

    fx.engine.close().await;
    Ok(())
}

#[tokio::test]
async fn paused_engine_stops_fetching() -> Result<()> {
    let mut fx = fixture(ConsumerConfig::default());

    fx.engine.connect().await?;
    fx.engine.start()?;
    fx.engine.pause()?;

    let message = Message::new(payload(0), Utc::now());
    fx.transport.seed(InternalQueueType::Main, message.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.transport.retired_count(), 0, "paused loop must not fetch");

    fx.engine.resume()?;
    let transport = Arc::clone(&fx.transport);
    let id = message.id;
    assert!(
        wait_until(WAIT, move || {
            statuses_of(&transport, id) == [ConsumptionStatus::Sent]
        })
        .await
    );

    fx.engine.close().await;
    Ok(())
}

#[tokio::test]
async fn closed_engine_leaves_later_seeds_alone() -> Result<()> {
    let mut fx = fixture(ConsumerConfig::default());

    let delivered = Message::new(payload(0), Utc::now());
    fx.transport.seed(InternalQueueType::Main, delivered.clone());

    fx.engine.connect().await?;
    fx.engine.start()?;

    let transport = Arc::clone(&fx.transport);
    assert!(wait_until(WAIT, move || transport.retired_count() == 1).await);

    fx.engine.close().await;
    assert_eq!(fx.engine.state(), EngineState::Stopped);

    fx.transport.seed(InternalQueueType::Main, Message::new(payload(1), Utc::now()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.transport.retired_count(), 1, "closed engine must not consume");
    assert_eq!(fx.transport.pending_len(InternalQueueType::Main), 1);

    Ok(())
}

/// Push client that parks every push until the test releases permits.
struct GatedClient {
    gate: tokio::sync::Semaphore,
    waiting: AtomicUsize,
}

impl GatedClient {
    fn new() -> Self {
        Self { gate: tokio::sync::Semaphore::new(0), waiting: AtomicUsize::new(0) }
    }

    fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

impl PushClient for GatedClient {
    fn push(&self, _message: &Message) -> Pin<Box<dyn Future<Output = PushResponse> + Send + '_>> {
        Box::pin(async move {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            PushResponse::ok()
        })
    }
}

#[tokio::test]
async fn in_flight_cap_gates_fetching() -> Result<()> {
    init_tracing();
    let config = ConsumerConfig {
        max_in_flight_messages: 4,
        batch_size: 4,
        ..ConsumerConfig::default()
    };
    let transport = Arc::new(InMemoryTransport::new(config.max_retry_attempts));
    let client = Arc::new(GatedClient::new());
    let mut engine = ConsumerEngine::new(
        config,
        Arc::new(TestClock::new()),
        Arc::clone(&transport) as Arc<dyn TransportFactory>,
        Arc::clone(&client) as Arc<dyn PushClient>,
        Arc::new(InMemoryGroupState::new()),
    );

    for sequence in 0..10 {
        transport.seed(InternalQueueType::Main, Message::new(payload(sequence), Utc::now()));
    }

    engine.connect().await?;
    engine.start()?;

    let gate = Arc::clone(&client);
    assert!(wait_until(WAIT, move || gate.waiting() == 4).await);

    // With the cap saturated nothing further may be fetched.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.waiting(), 4);
    assert_eq!(engine.stats().in_flight_messages, 4);
    assert_eq!(transport.pending_len(InternalQueueType::Main), 6);

    client.release(10);
    let transport_done = Arc::clone(&transport);
    assert!(wait_until(WAIT, move || transport_done.retired_count() == 10).await);
    assert!(transport
        .statuses()
        .iter()
        .all(|(_, status)| *status == ConsumptionStatus::Sent));

    engine.close().await;
    Ok(())
}

#[tokio::test]
async fn escalation_produce_retries_through_rejections() -> Result<()> {
    let mut fx = fixture(ConsumerConfig::default());

    let message = Message::new(payload(0), Utc::now());
    fx.client.fail_times(message.id, 1);
    fx.transport.fail_next_produces(InternalQueueType::Retry(1), 2);
    fx.transport.seed(InternalQueueType::Main, message.clone());

    fx.engine.connect().await?;
    fx.engine.start()?;

    // Two rejected produces are retried away; the third lands and the
    // retry tier delivers.
    let transport = Arc::clone(&fx.transport);
    let id = message.id;
    assert!(
        wait_until(WAIT, move || {
            statuses_of(&transport, id).contains(&ConsumptionStatus::Sent)
        })
        .await
    );
    assert_eq!(fx.transport.produced(InternalQueueType::Retry(1)).len(), 1);

    fx.engine.close().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_produce_retries_retire_the_message() -> Result<()> {
    let config = ConsumerConfig { produce_retry_attempts: 2, ..ConsumerConfig::default() };
    let mut fx = fixture(config);

    let dropped = Message::new(payload(0), Utc::now());
    fx.client.fail_always(dropped.id);
    fx.transport.fail_next_produces(InternalQueueType::Retry(1), 2);
    fx.transport.seed(InternalQueueType::Main, dropped.clone());

    fx.engine.connect().await?;
    fx.engine.start()?;

    // Every produce attempt is rejected: the message retires as failed
    // without ever reaching the retry tier.
    let transport = Arc::clone(&fx.transport);
    assert!(wait_until(WAIT, move || transport.retired_count() == 1).await);
    assert_eq!(statuses_of(&fx.transport, dropped.id), [ConsumptionStatus::Failed]);
    assert!(fx.transport.produced(InternalQueueType::Retry(1)).is_empty());

    // The loop survived the exhaustion: a later seed flows through.
    let follow_up = Message::new(payload(1), Utc::now());
    fx.transport.seed(InternalQueueType::Main, follow_up.clone());
    let transport = Arc::clone(&fx.transport);
    assert!(wait_until(WAIT, move || transport.retired_count() == 2).await);
    assert_eq!(statuses_of(&fx.transport, follow_up.id), [ConsumptionStatus::Sent]);

    fx.engine.close().await;
    Ok(())
}
