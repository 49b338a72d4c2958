//! Message Bus
//!
//! Typed in-process publish/subscribe. Immediate, broadcast, unicast and
//! multicast messages are delivered synchronously on the publisher's thread;
//! queued messages go into a bounded priority queue per subscription and are
//! delivered by a background dispatcher thread.

pub mod message;
pub mod queue;
pub mod stats;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};

pub use message::{DeliveryMode, Message};
pub use queue::{BoundedPriorityQueue, PushOutcome};
pub use stats::{BusStats, TypeStats};

use stats::StatsCollector;

/// Subscribes to every message type
pub const ALL_TYPES: &str = "*";

/// Sender id used for host events
pub const HOST_SENDER: &str = "plughost";

/// Message types published by the host
pub mod topics {
    pub const STATE_CHANGED: &str = "plugin.state_changed";
    pub const LOADED: &str = "plugin.loaded";
    pub const UNLOADED: &str = "plugin.unloaded";
    pub const HEALTH: &str = "plugin.health";
    pub const RELOAD: &str = "plugin.reload";
    pub const TRANSACTION_COMPLETED: &str = "transaction.completed";
}

/// Message handler; errors are counted and logged, never returned to the publisher
pub type MessageHandler = Arc<dyn Fn(&Message) -> PluginResult<()> + Send + Sync>;

/// Predicate applied before a message is delivered or enqueued
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Opaque subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of each subscription's queue
    pub queue_depth: usize,
    /// Number of latency samples kept for statistics
    pub latency_samples: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            latency_samples: 1024,
        }
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: Uuid,
    /// Handlers invoked synchronously
    pub delivered: usize,
    /// Subscriptions the message was enqueued for
    pub queued: usize,
    /// Older messages evicted to make room
    pub evicted: usize,
}

/// Observable view of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub subscriber_id: String,
    pub message_type: String,
    pub has_filter: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub delivered_count: u64,
    pub pending: usize,
}

struct Queued {
    message: Arc<Message>,
    enqueued_at: Instant,
}

struct Subscription {
    id: SubscriptionId,
    subscriber_id: String,
    message_type: String,
    filter: Option<MessageFilter>,
    handler: MessageHandler,
    active: AtomicBool,
    created_at: DateTime<Utc>,
    delivered_count: AtomicU64,
    queue: Mutex<BoundedPriorityQueue<Queued>>,
    delivering: Mutex<()>,
}

impl Subscription {
    fn matches(&self, message: &Message) -> bool {
        self.active.load(Ordering::Acquire)
            && (self.message_type == message.message_type || self.message_type == ALL_TYPES)
            && message.is_addressed_to(&self.subscriber_id)
            && self.filter.as_ref().map_or(true, |filter| filter(message))
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            subscriber_id: self.subscriber_id.clone(),
            message_type: self.message_type.clone(),
            has_filter: self.filter.is_some(),
            active: self.active.load(Ordering::Acquire),
            created_at: self.created_at,
            delivered_count: self.delivered_count.load(Ordering::Relaxed),
            pending: self.queue.lock().len(),
        }
    }
}

struct BusShared {
    config: BusConfig,
    subscriptions: RwLock<BTreeMap<SubscriptionId, Arc<Subscription>>>,
    stats: Mutex<StatsCollector>,
    next_id: AtomicU64,
}

impl BusShared {
    fn matching(&self, message: &Message) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .values()
            .filter(|sub| sub.matches(message))
            .cloned()
            .collect()
    }

    /// Invoke one handler; returns whether it succeeded
    fn deliver(&self, sub: &Subscription, message: &Message, started: Instant) -> bool {
        if !sub.active.load(Ordering::Acquire) {
            return false;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(message)));
        match outcome {
            Ok(Ok(())) => {
                sub.delivered_count.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .lock()
                    .record_received(&message.message_type, started.elapsed());
                true
            }
            Ok(Err(e)) => {
                self.stats.lock().record_failed();
                warn!(
                    "Subscriber '{}' failed to handle '{}': {}",
                    sub.subscriber_id, message.message_type, e
                );
                false
            }
            Err(_) => {
                self.stats.lock().record_failed();
                error!(
                    "Subscriber '{}' panicked while handling '{}'",
                    sub.subscriber_id, message.message_type
                );
                false
            }
        }
    }

    /// Deliver everything waiting in every queue
    fn drain_all(&self) -> usize {
        let subs: Vec<_> = self.subscriptions.read().values().cloned().collect();
        let mut delivered = 0;
        for sub in subs {
            // another thread (or an outer frame of this one) is already draining it
            let _guard = match sub.delivering.try_lock() {
                Some(guard) => guard,
                None => continue,
            };
            loop {
                let next = sub.queue.lock().pop();
                match next {
                    Some((_, queued)) => {
                        if self.deliver(&sub, &queued.message, queued.enqueued_at) {
                            delivered += 1;
                        }
                    }
                    None => break,
                }
            }
        }
        delivered
    }

    fn pending(&self) -> usize {
        self.subscriptions
            .read()
            .values()
            .map(|sub| sub.queue.lock().len())
            .sum()
    }

    fn is_idle(&self) -> bool {
        self.subscriptions
            .read()
            .values()
            .all(|sub| sub.queue.lock().is_empty() && !sub.delivering.is_locked())
    }
}

/// In-process message bus
pub struct MessageBus {
    shared: Arc<BusShared>,
    wake: Option<Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl MessageBus {
    /// Create a bus and start its dispatcher thread
    pub fn new(config: BusConfig) -> Self {
        let shared = Arc::new(BusShared {
            stats: Mutex::new(StatsCollector::new(config.latency_samples)),
            config,
            subscriptions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        });
        let (wake, signals) = bounded::<()>(1);
        let worker = shared.clone();
        let dispatcher = std::thread::Builder::new()
            .name("plughost-bus".to_string())
            .spawn(move || Self::dispatch_loop(worker, signals));
        let dispatcher = match dispatcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start bus dispatcher, queued messages need process_pending: {}", e);
                None
            }
        };
        Self {
            shared,
            wake: Some(wake),
            dispatcher,
        }
    }

    fn dispatch_loop(shared: Arc<BusShared>, signals: Receiver<()>) {
        debug!("Bus dispatcher started");
        while signals.recv().is_ok() {
            shared.drain_all();
        }
        // publisher side is gone; flush what is left
        shared.drain_all();
        debug!("Bus dispatcher stopped");
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Register a handler for `message_type` (or [`ALL_TYPES`])
    pub fn subscribe<F>(
        &self,
        subscriber_id: &str,
        message_type: &str,
        handler: F,
        filter: Option<MessageFilter>,
    ) -> SubscriptionId
    where
        F: Fn(&Message) -> PluginResult<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            subscriber_id: subscriber_id.to_string(),
            message_type: message_type.to_string(),
            filter,
            handler: Arc::new(handler),
            active: AtomicBool::new(true),
            created_at: Utc::now(),
            delivered_count: AtomicU64::new(0),
            queue: Mutex::new(BoundedPriorityQueue::new(self.shared.config.queue_depth)),
            delivering: Mutex::new(()),
        });
        self.shared.subscriptions.write().insert(id, subscription);
        debug!("'{}' subscribed to '{}' ({})", subscriber_id, message_type, id);
        id
    }

    /// Remove all of a subscriber's subscriptions, or only those for one type.
    ///
    /// Unknown subscribers are a no-op. Handlers already running complete.
    pub fn unsubscribe(&self, subscriber_id: &str, message_type: Option<&str>) -> usize {
        let removed: Vec<Arc<Subscription>> = {
            let mut subs = self.shared.subscriptions.write();
            let ids: Vec<SubscriptionId> = subs
                .values()
                .filter(|sub| {
                    sub.subscriber_id == subscriber_id
                        && message_type.map_or(true, |t| sub.message_type == t)
                })
                .map(|sub| sub.id)
                .collect();
            ids.iter().filter_map(|id| subs.remove(id)).collect()
        };
        for sub in &removed {
            Self::deactivate(sub);
        }
        removed.len()
    }

    /// Remove one subscription by id
    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                Self::deactivate(&sub);
                true
            }
            None => false,
        }
    }

    /// Drop every subscription
    pub fn clear(&self) {
        let removed: Vec<_> = {
            let mut subs = self.shared.subscriptions.write();
            std::mem::take(&mut *subs).into_values().collect()
        };
        for sub in &removed {
            Self::deactivate(sub);
        }
    }

    fn deactivate(sub: &Subscription) {
        sub.active.store(false, Ordering::Release);
        let discarded = sub.queue.lock().clear();
        if discarded > 0 {
            debug!("Discarded {} queued messages for {}", discarded, sub.id);
        }
    }

    /// Publish a message according to its delivery mode
    pub fn publish(&self, message: Message) -> PluginResult<PublishReceipt> {
        if message.message_type.is_empty() {
            return Err(PluginError::invalid_parameters("Message type must not be empty")
                .with_context("sender", message.sender_id.clone()));
        }
        match message.delivery {
            DeliveryMode::Unicast if message.recipients.len() != 1 => {
                return Err(PluginError::invalid_parameters("Unicast requires exactly one recipient")
                    .with_context("message_type", message.message_type.clone()));
            }
            DeliveryMode::Multicast if message.recipients.is_empty() => {
                return Err(PluginError::invalid_parameters("Multicast requires at least one recipient")
                    .with_context("message_type", message.message_type.clone()));
            }
            _ => {}
        }

        let started = Instant::now();
        self.shared.stats.lock().record_sent(&message.message_type);
        let targets = self.shared.matching(&message);
        let mut receipt = PublishReceipt {
            message_id: message.id,
            delivered: 0,
            queued: 0,
            evicted: 0,
        };

        if message.delivery != DeliveryMode::Queued {
            for sub in &targets {
                if self.shared.deliver(sub, &message, started) {
                    receipt.delivered += 1;
                }
            }
            return Ok(receipt);
        }

        let priority = message.priority.rank();
        let message_type = message.message_type.clone();
        let shared_message = Arc::new(message);
        let mut rejected = 0usize;
        for sub in &targets {
            let entry = Queued {
                message: shared_message.clone(),
                enqueued_at: started,
            };
            let outcome = sub.queue.lock().push(priority, entry);
            match outcome {
                PushOutcome::Accepted => receipt.queued += 1,
                PushOutcome::Evicted(old) => {
                    receipt.queued += 1;
                    receipt.evicted += 1;
                    self.shared.stats.lock().record_dropped(&old.message.message_type);
                    warn!(
                        "Queue full for '{}', evicted '{}' message",
                        sub.subscriber_id, old.message.message_type
                    );
                }
                PushOutcome::Rejected(_) => {
                    rejected += 1;
                    self.shared.stats.lock().record_dropped(&message_type);
                }
            }
        }
        if receipt.queued > 0 {
            self.wake_dispatcher();
        }
        if rejected > 0 {
            warn!("Dropped '{}' for {} full subscriber queue(s)", message_type, rejected);
            return Err(PluginError::backpressure_dropped(format!(
                "Message '{}' dropped by {} full subscriber queue(s)",
                message_type, rejected
            ))
            .with_context("message_type", message_type)
            .with_context("rejected", rejected)
            .with_context("queued", receipt.queued));
        }
        Ok(receipt)
    }

    /// Broadcast a host event; failures are logged, never returned
    pub fn emit(&self, message_type: &str, payload: Value) {
        let message = Message::new(message_type, HOST_SENDER, payload).with_delivery(DeliveryMode::Broadcast);
        if let Err(e) = self.publish(message) {
            warn!("Failed to publish '{}': {}", message_type, e);
        }
    }

    fn wake_dispatcher(&self) {
        if let Some(wake) = &self.wake {
            match wake.try_send(()) {
                // a wake-up is already pending
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    warn!("Bus dispatcher is not running");
                }
            }
        }
    }

    /// Deliver queued messages on the calling thread; returns deliveries made
    pub fn process_pending(&self) -> usize {
        self.shared.drain_all()
    }

    /// Block until every queue is empty and no delivery is in progress
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    pub fn subscriptions_of(&self, subscriber_id: &str) -> Vec<SubscriptionInfo> {
        self.shared
            .subscriptions
            .read()
            .values()
            .filter(|sub| sub.subscriber_id == subscriber_id)
            .map(|sub| sub.info())
            .collect()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.shared.subscriptions.read().get(&id).map(|sub| sub.info())
    }

    pub fn stats(&self) -> BusStats {
        let subscriptions = self.subscription_count();
        let pending = self.pending();
        self.shared.stats.lock().snapshot(subscriptions, pending)
    }

    pub fn reset_stats(&self) {
        self.shared.stats.lock().reset();
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.wake.take();
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
