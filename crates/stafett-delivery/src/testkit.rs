//! In-memory fixtures for driving the engine without a broker.
//!
//! Provides an in-memory transport whose produced messages become fetchable
//! by the target queue's loop, a push client scripted per message ID, and a
//! hash-map ordering state. Everything records what passed through it so
//! tests assert on escalation paths and terminal statuses instead of
//! internals.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use stafett_core::models::{
    ConsumptionStatus, GroupPointer, InternalQueueType, Message, MessageId, MessagePointer,
    MessageTracker, Offset,
};

use crate::{
    client::{PushClient, PushResponse},
    error::{DeliveryError, Result},
    ordering::GroupOrderingState,
    transport::{MessageSource, Producer, TransportFactory},
};

type StatusLog = Arc<Mutex<Vec<(MessageId, ConsumptionStatus)>>>;
type StartLog = Arc<Mutex<Vec<(MessageId, InternalQueueType)>>>;

struct QueueStore {
    pending: Mutex<VecDeque<(Offset, Message)>>,
    produced: Mutex<Vec<Message>>,
    next_offset: AtomicU64,
    fail_produces: AtomicU32,
}

impl QueueStore {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            produced: Mutex::new(Vec::new()),
            next_offset: AtomicU64::new(0),
            fail_produces: AtomicU32::new(0),
        }
    }

    fn append(&self, message: Message) -> Offset {
        let offset = Offset(self.next_offset.fetch_add(1, Ordering::AcqRel));
        self.pending.lock().expect("queue store lock").push_back((offset, message));
        offset
    }
}

/// In-memory broker covering a full escalation ladder.
///
/// Escalation produces land in the target queue's pending messages, so
/// multi-hop journeys (main, retry tiers, dead letter) play out end to end.
pub struct InMemoryTransport {
    queues: HashMap<InternalQueueType, Arc<QueueStore>>,
    statuses: StatusLog,
    starts: StartLog,
}

impl InMemoryTransport {
    /// Creates stores for `Main`, `Retry(1..=max_retry)`, and `DeadLetter`.
    pub fn new(max_retry: u8) -> Self {
        let mut queues = HashMap::new();
        queues.insert(InternalQueueType::Main, Arc::new(QueueStore::new()));
        for attempt in 1..=max_retry {
            queues.insert(InternalQueueType::Retry(attempt), Arc::new(QueueStore::new()));
        }
        queues.insert(InternalQueueType::DeadLetter, Arc::new(QueueStore::new()));
        Self {
            queues,
            statuses: Arc::new(Mutex::new(Vec::new())),
            starts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn store(&self, queue: InternalQueueType) -> Result<Arc<QueueStore>> {
        self.queues
            .get(&queue)
            .cloned()
            .ok_or_else(|| DeliveryError::internal(format!("no in-memory store for {queue}")))
    }

    /// Places a message directly into `queue` as pre-existing content.
    ///
    /// # Panics
    ///
    /// Panics if the transport was not built with that queue.
    pub fn seed(&self, queue: InternalQueueType, message: Message) -> Offset {
        self.store(queue).expect("seeded queue exists").append(message)
    }

    /// Messages escalated into `queue` via its producer, in produce order.
    pub fn produced(&self, queue: InternalQueueType) -> Vec<Message> {
        match self.queues.get(&queue) {
            Some(store) => store.produced.lock().expect("queue store lock").clone(),
            None => Vec::new(),
        }
    }

    /// Messages still waiting to be fetched from `queue`.
    pub fn pending_len(&self, queue: InternalQueueType) -> usize {
        match self.queues.get(&queue) {
            Some(store) => store.pending.lock().expect("queue store lock").len(),
            None => 0,
        }
    }

    /// Fails the next `count` produces into `queue`.
    pub fn fail_next_produces(&self, queue: InternalQueueType, count: u32) {
        if let Some(store) = self.queues.get(&queue) {
            store.fail_produces.store(count, Ordering::Release);
        }
    }

    /// Every tracker retirement observed, in completion order.
    pub fn statuses(&self) -> Vec<(MessageId, ConsumptionStatus)> {
        self.statuses.lock().expect("status log lock").clone()
    }

    /// Terminal status of `id`, if it retired.
    pub fn retired(&self, id: MessageId) -> Option<ConsumptionStatus> {
        self.statuses
            .lock()
            .expect("status log lock")
            .iter()
            .find(|(logged, _)| *logged == id)
            .map(|(_, status)| *status)
    }

    /// Number of retired trackers.
    pub fn retired_count(&self) -> usize {
        self.statuses.lock().expect("status log lock").len()
    }

    /// Consume starts observed, in launch order.
    pub fn consume_starts(&self) -> Vec<(MessageId, InternalQueueType)> {
        self.starts.lock().expect("start log lock").clone()
    }
}

impl TransportFactory for InMemoryTransport {
    fn create_source(
        &self,
        queue_type: InternalQueueType,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn MessageSource>>> + Send + '_>> {
        let store = self.store(queue_type);
        let statuses = Arc::clone(&self.statuses);
        let starts = Arc::clone(&self.starts);
        Box::pin(async move {
            let store = store?;
            Ok(Arc::new(InMemorySource { store, statuses, starts }) as Arc<dyn MessageSource>)
        })
    }

    fn create_producer(
        &self,
        queue_type: InternalQueueType,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Producer>>> + Send + '_>> {
        let store = self.store(queue_type);
        Box::pin(async move {
            let store = store?;
            Ok(Arc::new(InMemoryProducer { store }) as Arc<dyn Producer>)
        })
    }
}

struct InMemorySource {
    store: Arc<QueueStore>,
    statuses: StatusLog,
    starts: StartLog,
}

impl MessageSource for InMemorySource {
    fn fetch_messages(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Box<dyn MessageTracker>>>> + Send + '_>> {
        let mut pending = self.store.pending.lock().expect("queue store lock");
        let take = batch_size.min(pending.len());
        let trackers = pending
            .drain(..take)
            .map(|(offset, message)| {
                Box::new(InMemoryTracker {
                    message,
                    offset,
                    statuses: Arc::clone(&self.statuses),
                    starts: Arc::clone(&self.starts),
                }) as Box<dyn MessageTracker>
            })
            .collect::<Vec<_>>();
        drop(pending);
        Box::pin(async move { Ok(trackers) })
    }
}

struct InMemoryProducer {
    store: Arc<QueueStore>,
}

impl Producer for InMemoryProducer {
    fn produce(&self, message: Message) -> Pin<Box<dyn Future<Output = Result<Offset>> + Send + '_>> {
        let store = Arc::clone(&self.store);
        Box::pin(async move {
            let remaining = store.fail_produces.load(Ordering::Acquire);
            if remaining > 0 {
                store.fail_produces.store(remaining - 1, Ordering::Release);
                return Err(DeliveryError::produce_rejected("scripted produce failure"));
            }
            store.produced.lock().expect("queue store lock").push(message.clone());
            Ok(store.append(message))
        })
    }
}

struct InMemoryTracker {
    message: Message,
    offset: Offset,
    statuses: StatusLog,
    starts: StartLog,
}

impl MessageTracker for InMemoryTracker {
    fn message(&self) -> &Message {
        &self.message
    }

    fn offset(&self) -> Offset {
        self.offset
    }

    fn on_consume_start(&mut self, queue: InternalQueueType) {
        self.starts.lock().expect("start log lock").push((self.message.id, queue));
    }

    fn on_consumed(self: Box<Self>, status: ConsumptionStatus) {
        self.statuses.lock().expect("status log lock").push((self.message.id, status));
    }
}

/// Push client scripted per message ID; unscripted pushes succeed.
#[derive(Default)]
pub struct ScriptedPushClient {
    fail_remaining: Mutex<HashMap<MessageId, u32>>,
    always_fail: Mutex<HashSet<MessageId>>,
    pushes: Mutex<Vec<MessageId>>,
}

impl ScriptedPushClient {
    /// Creates a client that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` pushes of `id`, then accepts.
    pub fn fail_times(&self, id: MessageId, count: u32) {
        self.fail_remaining.lock().expect("script lock").insert(id, count);
    }

    /// Fails every push of `id`.
    pub fn fail_always(&self, id: MessageId) {
        self.always_fail.lock().expect("script lock").insert(id);
    }

    /// Push attempts observed, in order.
    pub fn pushes(&self) -> Vec<MessageId> {
        self.pushes.lock().expect("push log lock").clone()
    }

    /// Number of push attempts for `id`.
    pub fn push_count(&self, id: MessageId) -> usize {
        self.pushes.lock().expect("push log lock").iter().filter(|logged| **logged == id).count()
    }

    fn verdict(&self, id: MessageId) -> PushResponse {
        self.pushes.lock().expect("push log lock").push(id);
        if self.always_fail.lock().expect("script lock").contains(&id) {
            return PushResponse::with_status(500, "scripted failure");
        }
        let mut remaining = self.fail_remaining.lock().expect("script lock");
        if let Some(count) = remaining.get_mut(&id) {
            if *count > 0 {
                *count -= 1;
                if *count == 0 {
                    remaining.remove(&id);
                }
                return PushResponse::with_status(500, "scripted failure");
            }
        }
        PushResponse::ok()
    }
}

impl PushClient for ScriptedPushClient {
    fn push(&self, message: &Message) -> Pin<Box<dyn Future<Output = PushResponse> + Send + '_>> {
        let response = self.verdict(message.id);
        Box::pin(async move { response })
    }
}

/// Hash-map ordering state: a group is pinned by a transition and released
/// by a success from the pinned queue.
#[derive(Default)]
pub struct InMemoryGroupState {
    pinned: Mutex<HashMap<String, InternalQueueType>>,
}

impl InMemoryGroupState {
    /// Creates an empty state; every group starts healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `group_id` is currently pinned to, if any.
    pub fn pinned_queue(&self, group_id: &str) -> Option<InternalQueueType> {
        self.pinned.lock().expect("group state lock").get(group_id).copied()
    }
}

impl GroupOrderingState for InMemoryGroupState {
    fn pointer_for(&self, group_id: &str) -> GroupPointer {
        match self.pinned_queue(group_id) {
            Some(queue) => GroupPointer::failed(queue),
            None => GroupPointer::healthy(),
        }
    }

    fn message_consumed(
        &self,
        group_id: &str,
        consumed_from: MessagePointer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let mut pinned = self.pinned.lock().expect("group state lock");
        if pinned.get(group_id) == Some(&consumed_from.queue) {
            pinned.remove(group_id);
        }
        drop(pinned);
        Box::pin(async { Ok(()) })
    }

    fn message_transitioned(
        &self,
        group_id: &str,
        _consumed_from: MessagePointer,
        failed_into: InternalQueueType,
        _produced_to: MessagePointer,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.pinned.lock().expect("group state lock").insert(group_id.to_owned(), failed_into);
        Box::pin(async { Ok(()) })
    }
}

/// Polls `condition` until it holds or `deadline` of wall-clock time
/// passes. Returns the final verdict.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
