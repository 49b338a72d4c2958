//! Bus Messages

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plugin::metadata::Priority;

/// How a message reaches its subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    /// Synchronous on the publisher's thread
    #[default]
    Immediate,
    /// Enqueued per subscription and delivered by the background dispatcher
    Queued,
    /// Every subscriber of the type
    Broadcast,
    /// The single named recipient
    Unicast,
    /// The named recipient set
    Multicast,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryMode::Immediate => "immediate",
            DeliveryMode::Queued => "queued",
            DeliveryMode::Broadcast => "broadcast",
            DeliveryMode::Unicast => "unicast",
            DeliveryMode::Multicast => "multicast",
        };
        f.write_str(name)
    }
}

/// A typed bus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub payload: Value,
    pub delivery: DeliveryMode,
    /// Addressed subscribers for unicast and multicast delivery
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

impl Message {
    pub fn new<T: Into<String>, S: Into<String>>(message_type: T, sender_id: S, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            priority: Priority::Normal,
            payload,
            delivery: DeliveryMode::Immediate,
            recipients: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    /// Address a single subscriber
    pub fn to<S: Into<String>>(mut self, recipient: S) -> Self {
        self.delivery = DeliveryMode::Unicast;
        self.recipients = vec![recipient.into()];
        self
    }

    /// Address a set of subscribers
    pub fn to_many<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delivery = DeliveryMode::Multicast;
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `subscriber_id` is addressed (no recipients means everyone)
    pub fn is_addressed_to(&self, subscriber_id: &str) -> bool {
        self.recipients.is_empty() || self.recipients.iter().any(|r| r == subscriber_id)
    }
}
