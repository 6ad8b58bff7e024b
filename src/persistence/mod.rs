//! # Persistence Module
//!
//! ## Why This Module Exists
//! The session keeps a durable record of everything it sees: the topics it watches, the
//! messages the broker delivered on them and the status of the broker connection. The
//! session only talks to storage through the narrow [`Store`] trait defined here, so the
//! record store can be swapped (in-memory for tests, snapshot-backed for the CLI, a
//! database behind an HTTP layer) without touching connection logic.
//!
//! ## Key Abstractions
//! - **Topic**: a named channel, unique by name, with an `is_active` flag that decides
//!   whether it is subscribed on connect
//! - **Message**: one inbound delivery, immutable after creation, owned by a topic
//! - **ConnectionRecord**: status of the session against one `(host, port)` pair
//!
//! ## Store Responsibilities
//! Timestamps (`created_at`, `updated_at`, `received_at`) are set by the store on every
//! write, never by callers. Deleting a topic explicitly deletes its messages.

pub mod memory_store;
pub mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

use crate::mqtt::error::SessionError;

/// Number of messages per page returned by [`message_page`].
pub const MESSAGES_PER_PAGE: usize = 50;

/// Characters shown by [`Message::payload_preview`].
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Topic name must not be empty")]
    EmptyTopicName,

    #[error("Invalid QoS level: {0}, must be 0, 1 or 2")]
    InvalidQos(u8),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Connection record not found: {0}")]
    RecordNotFound(u64),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Delivery guarantee of a subscription or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = StoreError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(StoreError::InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Qos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// A topic the session knows about.
///
/// Created by an operator through the subscribe path (active) or discovered from an
/// inbound message (inactive unless activated later).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: u64,
    /// Unique, non-empty topic name (e.g. `sensor/temperature`)
    pub name: String,
    pub description: String,
    /// Whether the topic is subscribed on every successful connect
    pub is_active: bool,
    pub qos: Qos,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Attribute values used when `get_or_create_topic` has to create the topic.
///
/// `None` leaves the store default in place (`is_active = false`, `qos = 1`).
#[derive(Debug, Clone, Default)]
pub struct TopicDefaults {
    pub description: String,
    pub is_active: Option<bool>,
    pub qos: Option<Qos>,
}

/// A message delivered by the broker. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub topic_id: u64,
    /// Opaque payload bytes as delivered
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    /// Origin timestamp
    pub timestamp: DateTime<Utc>,
    /// Set by the store when the message is written
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Payload as text, replacing malformed UTF-8.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Payload as strict UTF-8 text.
    pub fn payload_str(&self) -> Result<&str, SessionError> {
        std::str::from_utf8(&self.payload).map_err(|e| SessionError::Decode(e.to_string()))
    }

    /// First 100 characters of the payload, with `...` appended when truncated.
    pub fn payload_preview(&self) -> String {
        let text = self.payload_text();
        if text.chars().count() > PREVIEW_CHARS {
            let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
            preview.push_str("...");
            preview
        } else {
            text.into_owned()
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.timestamp, self.payload_preview())
    }
}

/// Connection status as stored on a [`ConnectionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Status of the session against one broker `(host, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: u64,
    pub broker_host: String,
    pub broker_port: u16,
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    /// Empty when the last transition was not an error
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}",
            self.broker_host, self.broker_port, self.status
        )
    }
}

/// One page of a topic's message history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page_number: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_previous: bool,
}

/// Durable record store consumed by the session.
///
/// Implementations must be safe to call from the session worker and from caller threads
/// at the same time. Calls are expected to return quickly; the session invokes them from
/// its I/O worker.
pub trait Store: Send + Sync {
    /// Returns the topic named `name`, creating it from `defaults` if missing.
    /// The flag is `true` when the topic was created by this call.
    fn get_or_create_topic(
        &self,
        name: &str,
        defaults: TopicDefaults,
    ) -> Result<(Topic, bool), StoreError>;

    /// Writes back a modified topic (matched by id) and refreshes `updated_at`.
    fn update_topic(&self, topic: &Topic) -> Result<Topic, StoreError>;

    fn find_topic(&self, name: &str) -> Result<Option<Topic>, StoreError>;

    /// All topics ordered by name.
    fn list_topics(&self) -> Result<Vec<Topic>, StoreError>;

    /// Topics with `is_active = true`, ordered by name.
    fn list_active_topics(&self) -> Result<Vec<Topic>, StoreError>;

    /// Deletes a topic together with all of its messages.
    fn delete_topic(&self, name: &str) -> Result<bool, StoreError>;

    fn create_message(
        &self,
        topic: &Topic,
        payload: &[u8],
        qos: Qos,
        retain: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, StoreError>;

    fn count_messages(&self, topic: &Topic) -> Result<usize, StoreError>;

    /// Deletes the oldest messages of `topic` (by received order) until at most
    /// `keep_count` remain. Returns the number of deleted messages.
    fn delete_oldest_messages(&self, topic: &Topic, keep_count: usize)
        -> Result<usize, StoreError>;

    /// Messages of `topic`, newest first, skipping `offset` and returning at most `limit`.
    fn list_messages(
        &self,
        topic: &Topic,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    fn latest_message(&self, topic: &Topic) -> Result<Option<Message>, StoreError> {
        Ok(self.list_messages(topic, 0, 1)?.into_iter().next())
    }

    /// Most recently received messages across all topics.
    fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError>;

    fn count_all_messages(&self) -> Result<usize, StoreError>;

    /// Returns the record for `(host, port)`, creating it with status `default_status`
    /// if missing. The flag is `true` when the record was created by this call.
    fn get_or_create_connection_record(
        &self,
        host: &str,
        port: u16,
        default_status: ConnectionStatus,
    ) -> Result<(ConnectionRecord, bool), StoreError>;

    /// Writes back a modified record (matched by id) and refreshes `updated_at`.
    fn update_connection_record(
        &self,
        record: &ConnectionRecord,
    ) -> Result<ConnectionRecord, StoreError>;

    /// The most recently updated connection record, if any.
    fn latest_connection_record(&self) -> Result<Option<ConnectionRecord>, StoreError>;
}

/// Reads page `page` (1-based) of a topic's history. Out-of-range pages are clamped.
pub fn message_page(
    store: &dyn Store,
    topic: &Topic,
    page: usize,
) -> Result<MessagePage, StoreError> {
    let total = store.count_messages(topic)?;
    let total_pages = total.div_ceil(MESSAGES_PER_PAGE).max(1);
    let page_number = page.clamp(1, total_pages);
    let messages = store.list_messages(
        topic,
        (page_number - 1) * MESSAGES_PER_PAGE,
        MESSAGES_PER_PAGE,
    )?;

    Ok(MessagePage {
        messages,
        page_number,
        total_pages,
        has_next: page_number < total_pages,
        has_previous: page_number > 1,
    })
}
