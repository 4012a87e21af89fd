//! Subscriber registry and the fan-out engine.
//!
//! The registry holds two related views: the replicated registration
//! table, built from applied subscribe/unsubscribe entries and identical
//! on every node, and the map of live connections, which only exists on
//! the node holding each subscriber's socket.
//!
//! Fan-out is driven by the apply stream: every applied publish is
//! enqueued exactly once on the outbound queue of every local connection
//! whose topic set contained the message's topic at that moment. Queues
//! are bounded; when one overflows the oldest frame is dropped with a
//! warning, and a connection that keeps overflowing is detached.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::raft::Subscription;
use crate::raft::Unsubscription;
use crate::storage::AppliedEvent;
use crate::storage::StoredMessage;
use crate::storage::SubscriberInfo;
use crate::unix_ms;
use crate::NodeId;

/// Aggregate broker counters, served by `GET /stats`.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub messages_published: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub publisher_connections: AtomicU64,
    pub subscriber_connections: AtomicU64,
}

/// A bounded outbound frame queue for one subscriber connection.
///
/// The connection's writer task drains it; the fan-out engine fills it.
/// Overflow drops the oldest frame so a slow consumer sheds history
/// rather than stalling apply.
pub struct OutboundQueue {
    frames: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    overflow_limit: u32,
    overflows: AtomicU64,
    detached: AtomicBool,
}

impl OutboundQueue {
    fn new(capacity: usize, overflow_limit: u32) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            overflow_limit,
            overflows: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame, dropping the oldest when full. Returns `false`
    /// when the connection has overflowed often enough to be detached.
    pub fn push(&self, frame: String) -> bool {
        {
            let mut frames = self.frames.lock().expect("outbound queue lock poisoned");
            if frames.len() >= self.capacity {
                frames.pop_front();
                let overflows = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(overflows, "subscriber outbound queue full, dropping oldest frame");
                if overflows >= self.overflow_limit as u64 {
                    self.detach();
                    return false;
                }
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Await the next frame; `None` once the connection is detached and
    /// the queue is drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut frames = self.frames.lock().expect("outbound queue lock poisoned");
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.detached.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.frames.lock().expect("outbound queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the connection for teardown and wake its writer.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// One registered topic's subscriber set, behind its own lock.
type TopicSet = Arc<RwLock<HashSet<String>>>;

/// The subscriber registry of one broker node.
pub struct SubscriberRegistry {
    node_id: NodeId,
    /// Replicated registrations: topic -> subscriber IDs, with per-topic
    /// locking.
    topics: RwLock<HashMap<String, TopicSet>>,
    /// Replicated per-subscriber info, used by `GET /subscribers`.
    info: RwLock<HashMap<String, SubscriberInfo>>,
    /// Live local connections: subscriber ID -> outbound queue.
    connections: RwLock<HashMap<String, Arc<OutboundQueue>>>,
    queue_capacity: usize,
    overflow_limit: u32,
    stats: Arc<BrokerStats>,
    /// Subscribers detached by the fan-out engine; the protocol layer
    /// drains this and proposes their removal through consensus.
    detached_tx: mpsc::UnboundedSender<String>,
}

impl SubscriberRegistry {
    /// Create a registry; the returned receiver yields the IDs of
    /// subscribers force-detached by the fan-out engine.
    pub fn new(
        node_id: NodeId,
        queue_capacity: usize,
        overflow_limit: u32,
        stats: Arc<BrokerStats>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (detached_tx, detached_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            node_id,
            topics: RwLock::new(HashMap::new()),
            info: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            queue_capacity,
            overflow_limit,
            stats,
            detached_tx,
        });
        (registry, detached_rx)
    }

    /// Register a live connection, returning its outbound queue.
    ///
    /// Registering the same subscriber ID again replaces the previous
    /// connection, which is detached.
    pub fn register_connection(&self, subscriber_id: &str) -> Arc<OutboundQueue> {
        let queue = Arc::new(OutboundQueue::new(self.queue_capacity, self.overflow_limit));
        let mut conns = self.connections.write().expect("connections lock poisoned");
        if let Some(old) = conns.insert(subscriber_id.to_string(), queue.clone()) {
            old.detach();
        }
        queue
    }

    /// Remove a live connection, returning the topics it was registered
    /// for so the caller can propose the unsubscriptions.
    pub fn drop_connection(&self, subscriber_id: &str) -> Vec<String> {
        if let Some(queue) = self
            .connections
            .write()
            .expect("connections lock poisoned")
            .remove(subscriber_id)
        {
            queue.detach();
        }
        self.topics_of(subscriber_id)
    }

    /// The topics a subscriber is currently registered for.
    pub fn topics_of(&self, subscriber_id: &str) -> Vec<String> {
        self.info
            .read()
            .expect("info lock poisoned")
            .get(subscriber_id)
            .map(|info| info.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a heartbeat for a locally connected subscriber.
    pub fn record_heartbeat(&self, subscriber_id: &str) {
        if let Some(info) = self.info.write().expect("info lock poisoned").get_mut(subscriber_id) {
            info.last_heartbeat_ms = unix_ms();
        }
    }

    /// The replicated registration table.
    pub fn snapshot(&self) -> Vec<SubscriberInfo> {
        let mut all: Vec<_> = self.info.read().expect("info lock poisoned").values().cloned().collect();
        all.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        all
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections.read().expect("connections lock poisoned").len()
    }

    /// Apply one event from the apply stream. Called only by the fan-out
    /// task, in apply order.
    pub fn apply_event(&self, event: AppliedEvent) {
        match event {
            AppliedEvent::Published(stored) => self.deliver(&stored),
            AppliedEvent::Subscribed { subscription, .. } => self.apply_subscribe(subscription),
            AppliedEvent::Unsubscribed { unsubscription, .. } => self.apply_unsubscribe(unsubscription),
            AppliedEvent::Noop { .. } => {}
        }
    }

    fn apply_subscribe(&self, sub: Subscription) {
        let topic_set = {
            let mut topics = self.topics.write().expect("topics lock poisoned");
            topics.entry(sub.topic.clone()).or_default().clone()
        };
        topic_set
            .write()
            .expect("topic set lock poisoned")
            .insert(sub.subscriber_id.clone());

        let mut info = self.info.write().expect("info lock poisoned");
        let entry = info.entry(sub.subscriber_id.clone()).or_insert_with(|| SubscriberInfo {
            subscriber_id: sub.subscriber_id.clone(),
            node_id: sub.node_id,
            topics: BTreeSet::new(),
            last_heartbeat_ms: unix_ms(),
        });
        entry.node_id = sub.node_id;
        entry.topics.insert(sub.topic);
    }

    fn apply_unsubscribe(&self, unsub: Unsubscription) {
        if let Some(topic_set) = self
            .topics
            .read()
            .expect("topics lock poisoned")
            .get(&unsub.topic)
            .cloned()
        {
            topic_set
                .write()
                .expect("topic set lock poisoned")
                .remove(&unsub.subscriber_id);
        }

        let mut info = self.info.write().expect("info lock poisoned");
        let emptied = if let Some(entry) = info.get_mut(&unsub.subscriber_id) {
            entry.topics.remove(&unsub.topic);
            entry.topics.is_empty()
        } else {
            false
        };
        if emptied {
            info.remove(&unsub.subscriber_id);
        }
    }

    /// Push a committed message to every matching local connection.
    fn deliver(&self, stored: &StoredMessage) {
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);

        let topic_set = match self
            .topics
            .read()
            .expect("topics lock poisoned")
            .get(&stored.message.topic)
            .cloned()
        {
            Some(set) => set,
            None => return,
        };
        let subscribers: Vec<String> = topic_set
            .read()
            .expect("topic set lock poisoned")
            .iter()
            .cloned()
            .collect();
        if subscribers.is_empty() {
            return;
        }

        let frame = stored.message.to_frame();
        let conns = self.connections.read().expect("connections lock poisoned");
        for subscriber_id in subscribers {
            let queue = match conns.get(&subscriber_id) {
                Some(queue) => queue,
                // Registered on another node, or the connection is gone.
                None => continue,
            };
            if queue.push(frame.clone()) {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subscriber = %subscriber_id, "subscriber detached after repeated overflow");
                let _ = self.detached_tx.send(subscriber_id);
            }
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn stats(&self) -> &Arc<BrokerStats> {
        &self.stats
    }
}

/// Spawn the fan-out engine: the single consumer of the apply stream.
///
/// Processing events in apply order is what makes delivery deterministic:
/// a publish sees exactly the registrations applied before it.
pub fn spawn_fanout(
    registry: Arc<SubscriberRegistry>,
    mut applied_rx: mpsc::UnboundedReceiver<AppliedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(event) = applied_rx.recv().await {
                registry.apply_event(event);
            }
            tracing::debug!("apply stream closed, fan-out engine exiting");
        }
        .instrument(tracing::debug_span!("fanout")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::message::PayloadFormat;

    fn registry() -> (Arc<SubscriberRegistry>, mpsc::UnboundedReceiver<String>) {
        SubscriberRegistry::new(0, 4, 2, Arc::new(BrokerStats::default()))
    }

    fn stored(topic: &str, value: &str, seq_no: u64) -> StoredMessage {
        StoredMessage {
            seq_no,
            log_index: seq_no,
            message: Message {
                id: seq_no,
                event_name: "e".into(),
                value: value.into(),
                topic: topic.into(),
                format: PayloadFormat::Raw,
                body: format!("[{}] {}", topic, value),
            },
        }
    }

    fn subscription(id: &str, topic: &str) -> Subscription {
        Subscription {
            subscriber_id: id.into(),
            node_id: 0,
            topic: topic.into(),
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_local_subscriber() {
        let (registry, _detached) = registry();
        let queue = registry.register_connection("sub-1");
        registry.apply_subscribe(subscription("sub-1", "news"));

        registry.deliver(&stored("news", "hello", 1));
        registry.deliver(&stored("sports", "skipped", 2));

        assert_eq!(queue.pop().await.unwrap(), "FORMAT:RAW|[news] hello");
        assert!(queue.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_subscribe_is_idempotent() {
        let (registry, _detached) = registry();
        let queue = registry.register_connection("sub-1");
        registry.apply_subscribe(subscription("sub-1", "news"));
        registry.apply_subscribe(subscription("sub-1", "news"));

        registry.deliver(&stored("news", "once", 1));
        assert_eq!(queue.pop().await.unwrap(), "FORMAT:RAW|[news] once");
        assert!(queue.frames.lock().unwrap().is_empty());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].topics.iter().collect::<Vec<_>>(), vec!["news"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_registration() {
        let (registry, _detached) = registry();
        let _queue = registry.register_connection("sub-1");
        registry.apply_subscribe(subscription("sub-1", "news"));
        registry.apply_unsubscribe(Unsubscription {
            subscriber_id: "sub-1".into(),
            topic: "news".into(),
        });
        assert!(registry.snapshot().is_empty());
        assert!(registry.topics_of("sub-1").is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_then_detaches() {
        let (registry, mut detached) = registry();
        let queue = registry.register_connection("slow");
        registry.apply_subscribe(subscription("slow", "news"));

        // Capacity 4, overflow limit 2: the seventh push crosses the
        // detach threshold.
        for i in 0..7 {
            registry.deliver(&stored("news", &format!("m{}", i), i));
        }
        assert!(queue.is_detached());
        assert_eq!(detached.recv().await.unwrap(), "slow");

        // The oldest frames were shed, the newest retained.
        let first = queue.pop().await.unwrap();
        assert!(first.contains("m2"), "got {}", first);
    }

    #[tokio::test]
    async fn drop_connection_reports_topics_for_unsubscribe() {
        let (registry, _detached) = registry();
        let _queue = registry.register_connection("sub-1");
        registry.apply_subscribe(subscription("sub-1", "news"));
        registry.apply_subscribe(subscription("sub-1", "sports"));

        let mut topics = registry.drop_connection("sub-1");
        topics.sort();
        assert_eq!(topics, vec!["news".to_string(), "sports".to_string()]);
        assert_eq!(registry.active_connection_count(), 0);
    }
}
