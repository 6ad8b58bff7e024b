//! In-process [`Store`] implementation.
//!
//! All records live behind a single mutex. Critical sections are short (no I/O), so the
//! store can be called from the session worker without stalling it. Snapshots of the
//! whole state can be taken and restored, see [`super::snapshot`].

use super::{
    ConnectionRecord, ConnectionStatus, Message, Qos, Store, StoreError, Topic, TopicDefaults,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Serializable copy of a store's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub topics: Vec<Topic>,
    pub messages: Vec<Message>,
    pub connections: Vec<ConnectionRecord>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_topic_id: u64,
    next_message_id: u64,
    next_record_id: u64,
    topics: BTreeMap<u64, Topic>,
    topic_ids: HashMap<String, u64>,
    // per topic id, oldest first
    messages: HashMap<u64, VecDeque<Message>>,
    connections: BTreeMap<u64, ConnectionRecord>,
}

impl StoreState {
    fn topic_id(&self, topic: &Topic) -> Result<u64, StoreError> {
        match self.topic_ids.get(&topic.name) {
            Some(id) if *id == topic.id => Ok(*id),
            _ => Err(StoreError::TopicNotFound(topic.name.clone())),
        }
    }

    fn sorted_topics(&self, only_active: bool) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .topics
            .values()
            .filter(|topic| !only_active || topic.is_active)
            .cloned()
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Rebuilds a store from a snapshot. Id counters continue after the largest stored id.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut state = StoreState::default();

        for topic in snapshot.topics {
            state.next_topic_id = state.next_topic_id.max(topic.id);
            state.topic_ids.insert(topic.name.clone(), topic.id);
            state.topics.insert(topic.id, topic);
        }

        let mut messages = snapshot.messages;
        messages.sort_by_key(|msg| (msg.received_at, msg.id));
        for msg in messages {
            if !state.topics.contains_key(&msg.topic_id) {
                debug!("Dropping message {} of unknown topic {}", msg.id, msg.topic_id);
                continue;
            }
            state.next_message_id = state.next_message_id.max(msg.id);
            state.messages.entry(msg.topic_id).or_default().push_back(msg);
        }

        for record in snapshot.connections {
            state.next_record_id = state.next_record_id.max(record.id);
            state.connections.insert(record.id, record);
        }

        Self {
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let state = self.lock()?;
        let mut messages: Vec<Message> = state.messages.values().flatten().cloned().collect();
        messages.sort_by_key(|msg| msg.id);

        Ok(StoreSnapshot {
            topics: state.topics.values().cloned().collect(),
            messages,
            connections: state.connections.values().cloned().collect(),
        })
    }
}

impl Store for MemoryStore {
    fn get_or_create_topic(
        &self,
        name: &str,
        defaults: TopicDefaults,
    ) -> Result<(Topic, bool), StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptyTopicName);
        }

        let mut state = self.lock()?;
        if let Some(id) = state.topic_ids.get(name) {
            if let Some(topic) = state.topics.get(id) {
                return Ok((topic.clone(), false));
            }
        }

        state.next_topic_id += 1;
        let now = Utc::now();
        let topic = Topic {
            id: state.next_topic_id,
            name: name.to_string(),
            description: defaults.description,
            is_active: defaults.is_active.unwrap_or(false),
            qos: defaults.qos.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        state.topic_ids.insert(topic.name.clone(), topic.id);
        state.topics.insert(topic.id, topic.clone());
        debug!("Created topic {} ({})", topic.name, topic.id);
        Ok((topic, true))
    }

    fn update_topic(&self, topic: &Topic) -> Result<Topic, StoreError> {
        let mut state = self.lock()?;
        let id = state.topic_id(topic)?;
        let stored = state
            .topics
            .get_mut(&id)
            .ok_or_else(|| StoreError::TopicNotFound(topic.name.clone()))?;

        stored.description = topic.description.clone();
        stored.is_active = topic.is_active;
        stored.qos = topic.qos;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    fn find_topic(&self, name: &str) -> Result<Option<Topic>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .topic_ids
            .get(name)
            .and_then(|id| state.topics.get(id))
            .cloned())
    }

    fn list_topics(&self) -> Result<Vec<Topic>, StoreError> {
        Ok(self.lock()?.sorted_topics(false))
    }

    fn list_active_topics(&self) -> Result<Vec<Topic>, StoreError> {
        Ok(self.lock()?.sorted_topics(true))
    }

    fn delete_topic(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(id) = state.topic_ids.remove(name) else {
            return Ok(false);
        };
        state.topics.remove(&id);
        let removed = state.messages.remove(&id).map_or(0, |msgs| msgs.len());
        debug!("Deleted topic {} and {} messages", name, removed);
        Ok(true)
    }

    fn create_message(
        &self,
        topic: &Topic,
        payload: &[u8],
        qos: Qos,
        retain: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let mut state = self.lock()?;
        let topic_id = state.topic_id(topic)?;

        state.next_message_id += 1;
        let id = state.next_message_id;
        let queue = state.messages.entry(topic_id).or_default();
        // keep received order non-decreasing within a topic
        let received_at = match queue.back() {
            Some(last) if last.received_at > Utc::now() => last.received_at,
            _ => Utc::now(),
        };

        let msg = Message {
            id,
            topic_id,
            payload: payload.to_vec(),
            qos,
            retain,
            timestamp,
            received_at,
        };
        queue.push_back(msg.clone());
        Ok(msg)
    }

    fn count_messages(&self, topic: &Topic) -> Result<usize, StoreError> {
        let state = self.lock()?;
        let id = state.topic_id(topic)?;
        Ok(state.messages.get(&id).map_or(0, |msgs| msgs.len()))
    }

    fn delete_oldest_messages(
        &self,
        topic: &Topic,
        keep_count: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let id = state.topic_id(topic)?;
        let Some(queue) = state.messages.get_mut(&id) else {
            return Ok(0);
        };

        let excess = queue.len().saturating_sub(keep_count);
        queue.drain(..excess);
        Ok(excess)
    }

    fn list_messages(
        &self,
        topic: &Topic,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.lock()?;
        let id = state.topic_id(topic)?;
        Ok(state
            .messages
            .get(&id)
            .map(|msgs| msgs.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let state = self.lock()?;
        let mut messages: Vec<Message> = state.messages.values().flatten().cloned().collect();
        messages.sort_by(|a, b| (b.received_at, b.id).cmp(&(a.received_at, a.id)));
        messages.truncate(limit);
        Ok(messages)
    }

    fn count_all_messages(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.messages.values().map(VecDeque::len).sum())
    }

    fn get_or_create_connection_record(
        &self,
        host: &str,
        port: u16,
        default_status: ConnectionStatus,
    ) -> Result<(ConnectionRecord, bool), StoreError> {
        let mut state = self.lock()?;
        if let Some(record) = state
            .connections
            .values()
            .find(|record| record.broker_host == host && record.broker_port == port)
        {
            return Ok((record.clone(), false));
        }

        state.next_record_id += 1;
        let now = Utc::now();
        let record = ConnectionRecord {
            id: state.next_record_id,
            broker_host: host.to_string(),
            broker_port: port,
            status: default_status,
            last_connected: None,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        };
        state.connections.insert(record.id, record.clone());
        Ok((record, true))
    }

    fn update_connection_record(
        &self,
        record: &ConnectionRecord,
    ) -> Result<ConnectionRecord, StoreError> {
        let mut state = self.lock()?;
        let stored = state
            .connections
            .get_mut(&record.id)
            .ok_or(StoreError::RecordNotFound(record.id))?;

        stored.status = record.status;
        stored.last_connected = record.last_connected;
        stored.last_error = record.last_error.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    fn latest_connection_record(&self) -> Result<Option<ConnectionRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .connections
            .values()
            .max_by_key(|record| (record.updated_at, record.id))
            .cloned())
    }
}
