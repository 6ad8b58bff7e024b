//! Topic subscriptions driven by the store's active topics.
//!
//! The broker forgets subscriptions when a clean session ends, so every successful
//! connect re-issues one subscribe per active topic. Subscribing to a topic that is
//! already subscribed is idempotent at the protocol level, no deduplication happens here.
//!
//! `subscribe_all` runs on the session worker, which is also the only task draining the
//! transport's bounded request queue. Active topics are therefore packed into SUBSCRIBE
//! packets of up to [`SUBSCRIBE_BATCH`] filters, one queued request per packet.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::SessionError;
use super::transport::Transport;
use crate::persistence::{Qos, Store, Topic, TopicDefaults};

/// Topic filters per SUBSCRIBE packet issued by `subscribe_all`.
pub const SUBSCRIBE_BATCH: usize = 32;

#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn Store>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Subscribes every active topic with its stored QoS.
    ///
    /// `transport` is `None` while the session is not connected, in which case nothing is
    /// issued. Returns the number of topics whose subscribe the transport accepted.
    pub fn subscribe_all(&self, transport: Option<&dyn Transport>) -> usize {
        let Some(transport) = transport else {
            warn!("{}, skipping subscriptions", SessionError::NotConnected);
            return 0;
        };

        let topics = match self.store.list_active_topics() {
            Ok(topics) => topics,
            Err(e) => {
                error!("Failed to read active topics: {}", e);
                return 0;
            }
        };

        topics
            .chunks(SUBSCRIBE_BATCH)
            .map(|batch| Self::issue_batch(transport, batch))
            .sum()
    }

    /// Creates or re-activates `name` with the given QoS and description and subscribes
    /// to it when a transport is available.
    pub fn subscribe_topic(
        &self,
        transport: Option<&dyn Transport>,
        name: &str,
        description: &str,
        qos: Qos,
    ) -> Result<Topic, SessionError> {
        let (mut topic, created) = self.store.get_or_create_topic(
            name,
            TopicDefaults {
                description: description.to_string(),
                is_active: Some(true),
                qos: Some(qos),
            },
        )?;

        if !created {
            topic.is_active = true;
            topic.qos = qos;
            topic.description = description.to_string();
            topic = self.store.update_topic(&topic)?;
        }

        if let Some(transport) = transport {
            Self::issue(transport, &topic);
        }
        Ok(topic)
    }

    /// Marks `name` inactive and unsubscribes it when a transport is available.
    /// Returns `Ok(None)` when the topic is unknown.
    pub fn unsubscribe_topic(
        &self,
        transport: Option<&dyn Transport>,
        name: &str,
    ) -> Result<Option<Topic>, SessionError> {
        let Some(mut topic) = self.store.find_topic(name)? else {
            return Ok(None);
        };

        topic.is_active = false;
        let topic = self.store.update_topic(&topic)?;

        if let Some(transport) = transport {
            match transport.unsubscribe(&topic.name) {
                Ok(()) => info!("Unsubscribed from topic: {}", topic.name),
                Err(e) => error!("Failed to unsubscribe from {}: {}", topic.name, e),
            }
        }
        Ok(Some(topic))
    }

    fn issue_batch(transport: &dyn Transport, topics: &[Topic]) -> usize {
        let filters: Vec<(String, rumqttc::QoS)> = topics
            .iter()
            .map(|topic| (topic.name.clone(), topic.qos.into()))
            .collect();

        match transport.subscribe_many(&filters) {
            Ok(()) => {
                for topic in topics {
                    info!("Subscribed to topic: {} (qos {})", topic.name, topic.qos);
                }
                topics.len()
            }
            Err(e) => {
                error!("Failed to subscribe to {} topics: {}", topics.len(), e);
                0
            }
        }
    }

    fn issue(transport: &dyn Transport, topic: &Topic) -> bool {
        match transport.subscribe(&topic.name, topic.qos.into()) {
            Ok(()) => {
                info!("Subscribed to topic: {} (qos {})", topic.name, topic.qos);
                true
            }
            Err(e) => {
                error!("Failed to subscribe to {}: {}", topic.name, e);
                false
            }
        }
    }
}
