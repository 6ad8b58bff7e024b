//! # Session Manager
//!
//! Owns the single broker connection of the process and everything tied to its
//! lifecycle: the connection record in the store, the background I/O worker, topic
//! (re-)subscription on connect, ingestion of inbound messages and listener fan-out.
//!
//! ## Connection State Machine
//!
//! ```text
//!                 connect()                 CONNACK ok
//! Disconnected ─────────────► Connecting ─────────────► Connected
//!      ▲                          │                         │
//!      │                          │ CONNACK refused /       │ disconnect() /
//!      │                          │ network failure         │ connection lost
//!      │                          ▼                         │
//!      │                        Error ◄── (connect() again ─┘
//!      └──────────────────────────────────  leads back to Connecting)
//! ```
//!
//! Every transition is written to the store's [`ConnectionRecord`] for the target
//! `(host, port)`.
//!
//! ## Threading Model
//!
//! `connect()` spawns one tokio task per transport session. It drains the
//! [`EventSource`] and runs all event handlers; handlers only do short store calls and
//! never propagate errors, so a bad message cannot end the worker. Public operations may
//! be called from any thread. The connected flag is atomic; the transport handle and the
//! current record sit behind mutexes, always locked in the order handle → record.
//!
//! The worker never reconnects on its own. After a connection loss the session stays
//! disconnected until someone calls `connect()` again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rumqttc::{ConnectReturnCode, QoS, SubscribeReasonCode};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerSettings, Credentials};
use super::error::{ListenerError, SessionError};
use super::message_manager::{CallbackRegistry, ListenerId};
use super::retention::{RetentionTrimmer, DEFAULT_MAX_STORED_MESSAGES};
use super::subscription::SubscriptionManager;
use super::transport::{
    Connector, EventSource, MqttConnector, Transport, TransportEvent, TransportSession,
};
use crate::persistence::{
    message_page, ConnectionRecord, ConnectionStatus, Message, MessagePage, Qos, Store, Topic,
    TopicDefaults,
};

/// How long `shutdown` waits for the worker to flush and exit.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Default broker target and credentials used by `connect()`
    pub broker: BrokerSettings,
    /// Upper bound of stored messages per topic
    pub max_stored_messages: usize,
    /// QoS recorded for topics discovered through inbound messages
    pub default_qos: Qos,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            max_stored_messages: DEFAULT_MAX_STORED_MESSAGES,
            default_qos: Qos::default(),
        }
    }
}

/// Point-in-time view of the session for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub is_connected: bool,
    pub status: ConnectionStatus,
    pub connection: Option<ConnectionRecord>,
    pub active_topics: usize,
    pub total_messages: usize,
}

/// A running transport session and the worker draining it.
struct Link {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Prepared session: credentials chosen by `setup_session`, link present once connected.
struct SessionHandle {
    credentials: Option<Credentials>,
    link: Option<Link>,
}

struct SessionInner {
    settings: SessionSettings,
    store: Arc<dyn Store>,
    connector: Arc<dyn Connector>,
    subscriptions: SubscriptionManager,
    trimmer: RetentionTrimmer,
    callbacks: CallbackRegistry,
    handle: Mutex<Option<SessionHandle>>,
    is_connected: AtomicBool,
    record: Mutex<Option<ConnectionRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the process-wide broker session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let subscriptions = SubscriptionManager::new(store.clone());
        let trimmer = RetentionTrimmer::new(store.clone(), settings.max_stored_messages);

        Self {
            inner: Arc::new(SessionInner {
                settings,
                store,
                connector,
                subscriptions,
                trimmer,
                callbacks: CallbackRegistry::new(),
                handle: Mutex::new(None),
                is_connected: AtomicBool::new(false),
                record: Mutex::new(None),
            }),
        }
    }

    /// Session talking to a real broker through rumqttc.
    pub fn with_mqtt(settings: SessionSettings, store: Arc<dyn Store>) -> Self {
        Self::new(settings, store, Arc::new(MqttConnector))
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.inner.store.clone()
    }

    /// Tears down any existing transport session and prepares a fresh one using
    /// `credentials`. Performs no network I/O.
    pub fn setup_session(&self, credentials: Option<Credentials>) {
        let mut handle = lock(&self.inner.handle);
        self.inner.teardown(&mut handle);
        *handle = Some(SessionHandle {
            credentials,
            link: None,
        });
        debug!("MQTT session prepared");
    }

    /// Connects to the configured broker. See [`SessionManager::connect_to`].
    pub fn connect(&self) -> bool {
        let broker = &self.inner.settings.broker;
        self.connect_to(&broker.host, broker.port, broker.keepalive_secs)
    }

    /// Issues a connection attempt to `host:port` and starts the I/O worker.
    ///
    /// Returns `true` once the attempt is issued; establishment is reported later through
    /// the connection record. Must be called within a tokio runtime.
    pub fn connect_to(&self, host: &str, port: u16, keepalive_secs: u64) -> bool {
        let mut handle = lock(&self.inner.handle);

        if handle.as_ref().map_or(true, |h| h.link.is_some()) {
            let credentials = match handle.as_ref() {
                Some(prepared) => prepared.credentials.clone(),
                None => self.inner.settings.broker.credentials.clone(),
            };
            self.inner.teardown(&mut handle);
            *handle = Some(SessionHandle {
                credentials,
                link: None,
            });
        }

        match self.inner.open_link(&mut handle, host, port, keepalive_secs) {
            Ok(()) => {
                info!("Connecting to MQTT broker at {}:{}", host, port);
                true
            }
            Err(e) => {
                error!("Failed to connect to MQTT broker: {}", e);
                self.inner.record_error(&e.to_string());
                false
            }
        }
    }

    /// Stops the worker, closes the transport session and marks the record disconnected.
    pub fn disconnect(&self) {
        let mut handle = lock(&self.inner.handle);
        // the detached worker finishes flushing on its own
        let _worker = self.inner.teardown(&mut handle);
    }

    /// Like [`SessionManager::disconnect`], then waits for the worker to flush the
    /// DISCONNECT packet and exit.
    pub async fn shutdown(&self) {
        let worker = {
            let mut handle = lock(&self.inner.handle);
            self.inner.teardown(&mut handle)
        };

        if let Some(worker) = worker {
            match tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, worker).await {
                Ok(Ok(())) => debug!("MQTT worker joined"),
                Ok(Err(e)) => error!("MQTT worker failed: {}", e),
                Err(_) => warn!("Timed out waiting for MQTT worker to stop"),
            }
        }
    }

    /// Submits a publish. `true` only when the transport accepted the request; delivery
    /// acknowledgements are not awaited.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> bool {
        let Some(transport) = self.inner.connected_transport() else {
            warn!("{}, dropping publish to {}", SessionError::NotConnected, topic);
            return false;
        };

        match transport.publish(topic, payload, qos.into(), retain) {
            Ok(()) => {
                info!("Published message to {}", topic);
                true
            }
            Err(e) => {
                let e = SessionError::TransportPublish(e);
                error!("Failed to publish message to {}: {}", topic, e);
                false
            }
        }
    }

    /// Subscribes all active topics. Returns the number of subscribe requests issued.
    pub fn subscribe_all(&self) -> usize {
        self.inner.subscribe_all()
    }

    /// Creates or re-activates a topic and subscribes to it when connected.
    pub fn subscribe_topic(&self, name: &str, description: &str, qos: Qos) -> Option<Topic> {
        let transport = self.inner.connected_transport();
        match self
            .inner
            .subscriptions
            .subscribe_topic(transport.as_deref(), name, description, qos)
        {
            Ok(topic) => Some(topic),
            Err(e) => {
                error!("Failed to subscribe to topic {:?}: {}", name, e);
                None
            }
        }
    }

    /// Deactivates a topic and unsubscribes from it when connected.
    pub fn unsubscribe_topic(&self, name: &str) -> bool {
        let transport = self.inner.connected_transport();
        match self
            .inner
            .subscriptions
            .unsubscribe_topic(transport.as_deref(), name)
        {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!("Cannot unsubscribe unknown topic {}", name);
                false
            }
            Err(e) => {
                error!("Failed to unsubscribe from topic {}: {}", name, e);
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected.load(Ordering::Acquire)
    }

    /// Record of the current (or last) connection target.
    pub fn connection_record(&self) -> Option<ConnectionRecord> {
        lock(&self.inner.record).clone()
    }

    pub fn status(&self) -> SessionStatus {
        let store = &self.inner.store;
        let connection = self.connection_record().or_else(|| {
            store.latest_connection_record().unwrap_or_else(|e| {
                error!("Failed to read connection record: {}", e);
                None
            })
        });
        let active_topics = store.list_active_topics().map_or_else(
            |e| {
                error!("Failed to count active topics: {}", e);
                0
            },
            |topics| topics.len(),
        );
        let total_messages = store.count_all_messages().unwrap_or_else(|e| {
            error!("Failed to count messages: {}", e);
            0
        });

        SessionStatus {
            is_connected: self.is_connected(),
            status: connection
                .as_ref()
                .map_or(ConnectionStatus::Disconnected, |record| record.status),
            connection,
            active_topics,
            total_messages,
        }
    }

    /// Page `page` (1-based) of a topic's stored messages, newest first.
    pub fn topic_messages(&self, name: &str, page: usize) -> Option<MessagePage> {
        let store = self.inner.store.as_ref();
        let result = store.find_topic(name).and_then(|topic| match topic {
            Some(topic) => message_page(store, &topic, page).map(Some),
            None => Ok(None),
        });

        result.unwrap_or_else(|e| {
            error!("Failed to read messages of {}: {}", name, e);
            None
        })
    }

    /// Registers a listener invoked on the worker for every stored inbound message.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Topic, &Message) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.inner.callbacks.register(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.callbacks.unregister(id)
    }
}

impl SessionInner {
    /// Stops the current link, if any, and marks the session disconnected.
    /// Returns the worker of the stopped link.
    fn teardown(&self, handle: &mut Option<SessionHandle>) -> Option<JoinHandle<()>> {
        let link = handle.as_mut().and_then(|prepared| prepared.link.take());
        let mut record = lock(&self.record);

        let worker = link.map(|link| {
            if self.is_connected.load(Ordering::Acquire) {
                if let Err(e) = link.transport.disconnect() {
                    warn!("Error sending disconnect packet: {}", e);
                }
            }
            link.cancel.cancel();
            link.worker
        });

        self.is_connected.store(false, Ordering::Release);
        if let Some(record) = record.as_mut() {
            record.status = ConnectionStatus::Disconnected;
            self.persist(record);
        }
        if worker.is_some() {
            info!("Disconnected from MQTT broker");
        }
        worker
    }

    fn open_link(
        self: &Arc<Self>,
        handle: &mut Option<SessionHandle>,
        host: &str,
        port: u16,
        keepalive_secs: u64,
    ) -> Result<(), SessionError> {
        let (mut record, created) = self.store.get_or_create_connection_record(
            host,
            port,
            ConnectionStatus::Connecting,
        )?;
        if !created {
            record.status = ConnectionStatus::Connecting;
            record = self.store.update_connection_record(&record)?;
        }
        *lock(&self.record) = Some(record);

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::NoRuntime(e.to_string()))?;

        let prepared = handle.get_or_insert_with(|| SessionHandle {
            credentials: self.settings.broker.credentials.clone(),
            link: None,
        });
        let broker = BrokerSettings {
            host: host.to_string(),
            port,
            keepalive_secs,
            credentials: prepared.credentials.clone(),
            ..self.settings.broker.clone()
        };

        let TransportSession { transport, events } = self
            .connector
            .open(&broker)
            .map_err(|e| SessionError::TransportConnect(e.to_string()))?;

        let cancel = CancellationToken::new();
        let worker = runtime.spawn(run_worker(self.clone(), events, cancel.clone()));
        prepared.link = Some(Link {
            transport,
            cancel,
            worker,
        });
        Ok(())
    }

    fn connected_transport(&self) -> Option<Arc<dyn Transport>> {
        if !self.is_connected.load(Ordering::Acquire) {
            return None;
        }
        lock(&self.handle)
            .as_ref()
            .and_then(|prepared| prepared.link.as_ref())
            .map(|link| link.transport.clone())
    }

    fn subscribe_all(&self) -> usize {
        let transport = self.connected_transport();
        self.subscriptions.subscribe_all(transport.as_deref())
    }

    fn persist(&self, record: &mut ConnectionRecord) {
        match self.store.update_connection_record(record) {
            Ok(saved) => *record = saved,
            Err(e) => error!("Failed to persist connection status: {}", e),
        }
    }

    fn record_error(&self, reason: &str) {
        let mut record = lock(&self.record);
        if let Some(record) = record.as_mut() {
            record.status = ConnectionStatus::Error;
            record.last_error = reason.to_string();
            self.persist(record);
        }
    }

    fn handle_event(&self, event: TransportEvent, cancel: &CancellationToken) {
        match event {
            TransportEvent::ConnAck(code) => self.on_connect_event(code, cancel),
            TransportEvent::ConnectFailed(reason) => self.on_connect_failure(&reason, cancel),
            TransportEvent::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                self.on_message_event(&topic, &payload, qos, retain);
            }
            TransportEvent::SubAck { pkid, return_codes } => {
                self.on_subscribe_ack(pkid, &return_codes)
            }
            TransportEvent::PubAck { pkid } => self.on_publish_ack(pkid),
            TransportEvent::Disconnected(reason) => self.on_disconnect_event(&reason, cancel),
        }
    }

    fn on_connect_event(&self, code: ConnectReturnCode, cancel: &CancellationToken) {
        if code != ConnectReturnCode::Success {
            self.on_connect_failure(&format!("Connection failed with code {:?}", code), cancel);
            return;
        }

        {
            let mut record = lock(&self.record);
            if cancel.is_cancelled() {
                debug!("Ignoring CONNACK of a closed session");
                return;
            }
            self.is_connected.store(true, Ordering::Release);
            if let Some(record) = record.as_mut() {
                record.status = ConnectionStatus::Connected;
                record.last_connected = Some(Utc::now());
                record.last_error.clear();
                self.persist(record);
            }
        }

        info!("Connected to MQTT broker");
        self.subscribe_all();
    }

    fn on_connect_failure(&self, reason: &str, cancel: &CancellationToken) {
        let mut record = lock(&self.record);
        if cancel.is_cancelled() {
            return;
        }
        self.is_connected.store(false, Ordering::Release);
        error!("Failed to connect to MQTT broker: {}", reason);
        if let Some(record) = record.as_mut() {
            record.status = ConnectionStatus::Error;
            record.last_error = reason.to_string();
            self.persist(record);
        }
    }

    fn on_disconnect_event(&self, reason: &str, cancel: &CancellationToken) {
        let mut record = lock(&self.record);
        if cancel.is_cancelled() {
            return;
        }
        self.is_connected.store(false, Ordering::Release);
        if let Some(record) = record.as_mut() {
            record.status = ConnectionStatus::Disconnected;
            self.persist(record);
        }
        info!("Disconnected from MQTT broker: {}", reason);
    }

    /// Stores an inbound message, trims its topic and notifies listeners.
    fn on_message_event(
        &self,
        topic_name: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Option<Message> {
        let (topic, message) = match self.ingest(topic_name, payload, qos, retain) {
            Ok(stored) => stored,
            Err(e) => {
                error!("Error processing MQTT message on {}: {}", topic_name, e);
                return None;
            }
        };

        if let Err(e) = self.trimmer.trim(&topic) {
            error!("Failed to trim messages of {}: {}", topic.name, e);
        }

        info!(
            "Received message from {}: {}",
            topic.name,
            message.payload_preview()
        );
        self.callbacks.dispatch(&topic, &message);
        Some(message)
    }

    fn ingest(
        &self,
        topic_name: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(Topic, Message), SessionError> {
        let (topic, created) = self.store.get_or_create_topic(
            topic_name,
            TopicDefaults {
                description: format!("Auto-created topic for {}", topic_name),
                qos: Some(self.settings.default_qos),
                ..Default::default()
            },
        )?;
        if created {
            info!("Recorded new topic {}", topic.name);
        }

        let message =
            self.store
                .create_message(&topic, payload, qos.into(), retain, Utc::now())?;
        Ok((topic, message))
    }

    fn on_subscribe_ack(&self, pkid: u16, return_codes: &[SubscribeReasonCode]) {
        info!("Subscribed (pkid {}) with QoS: {:?}", pkid, return_codes);
    }

    fn on_publish_ack(&self, pkid: u16) {
        info!("Message published with pkid: {}", pkid);
    }
}

/// Drains one transport session until it ends or `cancel` fires.
async fn run_worker(
    inner: Arc<SessionInner>,
    mut events: Box<dyn EventSource>,
    cancel: CancellationToken,
) {
    info!("MQTT worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            event = events.next_event() => Some(event),
        };

        match next {
            None => {
                events.close().await;
                break;
            }
            Some(Some(event)) => inner.handle_event(event, &cancel),
            Some(None) => {
                debug!("MQTT event stream ended");
                break;
            }
        }
    }

    info!("MQTT worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::transport::testing::{Call, FakeConnector, OpenedSession};
    use crate::persistence::memory_store::MemoryStore;

    struct Harness {
        session: SessionManager,
        store: Arc<MemoryStore>,
        connector: Arc<FakeConnector>,
    }

    fn harness(max_stored_messages: usize) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(FakeConnector::default());
        let settings = SessionSettings {
            max_stored_messages,
            ..Default::default()
        };
        let session = SessionManager::new(settings, store.clone(), connector.clone());
        Harness {
            session,
            store,
            connector,
        }
    }

    fn add_topic(store: &MemoryStore, name: &str, active: bool, qos: Qos) {
        store
            .get_or_create_topic(
                name,
                TopicDefaults {
                    description: String::new(),
                    is_active: Some(active),
                    qos: Some(qos),
                },
            )
            .unwrap();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn status_of(session: &SessionManager) -> ConnectionStatus {
        session.connection_record().unwrap().status
    }

    async fn connect_established(h: &Harness) -> OpenedSession {
        assert!(h.session.connect());
        let opened = h.connector.last();
        opened
            .events
            .send(TransportEvent::ConnAck(ConnectReturnCode::Success))
            .unwrap();
        let session = h.session.clone();
        wait_for(move || session.is_connected()).await;
        opened
    }

    fn publish_event(topic: &str, payload: &str) -> TransportEvent {
        TransportEvent::Publish {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    #[tokio::test]
    async fn test_connect_then_connack_reaches_connected_and_subscribes() {
        let h = harness(1000);
        add_topic(&h.store, "sensor/temperature", true, Qos::AtLeastOnce);
        add_topic(&h.store, "sensor/humidity", true, Qos::ExactlyOnce);
        add_topic(&h.store, "sensor/ignored", false, Qos::AtMostOnce);

        assert!(h.session.connect());
        let record = h.session.connection_record().unwrap();
        assert_eq!(record.status, ConnectionStatus::Connecting);
        assert_eq!((record.broker_host.as_str(), record.broker_port), ("localhost", 1883));
        assert!(record.last_connected.is_none());
        assert!(!h.session.is_connected());

        let opened = h.connector.last();
        opened
            .events
            .send(TransportEvent::ConnAck(ConnectReturnCode::Success))
            .unwrap();
        let session = h.session.clone();
        wait_for(move || session.is_connected()).await;

        let record = h.session.connection_record().unwrap();
        assert_eq!(record.status, ConnectionStatus::Connected);
        assert!(record.last_connected.is_some());
        assert!(record.last_error.is_empty());
        assert_eq!(
            h.store.latest_connection_record().unwrap().unwrap().status,
            ConnectionStatus::Connected
        );
        assert_eq!(
            opened.transport.subscribes(),
            vec![
                ("sensor/humidity".to_string(), QoS::ExactlyOnce),
                ("sensor/temperature".to_string(), QoS::AtLeastOnce),
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_connack_moves_to_error() {
        let h = harness(1000);
        assert!(h.session.connect());
        h.connector
            .last()
            .events
            .send(TransportEvent::ConnAck(ConnectReturnCode::BadUserNamePassword))
            .unwrap();

        let session = h.session.clone();
        wait_for(move || status_of(&session) == ConnectionStatus::Error).await;
        let record = h.session.connection_record().unwrap();
        assert!(record.last_error.contains("BadUserNamePassword"));
        assert!(!h.session.is_connected());
        assert!(h.connector.last().transport.subscribes().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_before_connack_moves_to_error() {
        let h = harness(1000);
        assert!(h.session.connect());
        h.connector
            .last()
            .events
            .send(TransportEvent::ConnectFailed("I/O: connection refused".into()))
            .unwrap();

        let session = h.session.clone();
        wait_for(move || status_of(&session) == ConnectionStatus::Error).await;
        assert_eq!(
            h.session.connection_record().unwrap().last_error,
            "I/O: connection refused"
        );

        // error --connect()--> connecting
        assert!(h.session.connect());
        assert_eq!(status_of(&h.session), ConnectionStatus::Connecting);
        assert_eq!(h.connector.opened().len(), 2);
    }

    #[test]
    fn test_connect_outside_runtime_fails_and_records_error() {
        let h = harness(1000);
        assert!(!h.session.connect());
        let record = h.session.connection_record().unwrap();
        assert_eq!(record.status, ConnectionStatus::Error);
        assert!(record.last_error.contains("runtime"));
        assert!(h.connector.opened().is_empty());
    }

    #[tokio::test]
    async fn test_connector_failure_fails_and_records_error() {
        let h = harness(1000);
        h.connector
            .fail_open
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(!h.session.connect());
        let record = h.session.connection_record().unwrap();
        assert_eq!(record.status, ConnectionStatus::Error);
        assert!(record.last_error.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_disconnect_after_connect_closes_transport() {
        let h = harness(1000);
        let opened = connect_established(&h).await;

        h.session.disconnect();
        assert_eq!(status_of(&h.session), ConnectionStatus::Disconnected);
        assert!(!h.session.is_connected());
        assert_eq!(opened.transport.calls().last(), Some(&Call::Disconnect));

        let closed = opened.closed.clone();
        wait_for(move || closed.load(std::sync::atomic::Ordering::SeqCst)).await;

        // idempotent
        h.session.disconnect();
        assert_eq!(status_of(&h.session), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_ignores_late_connack() {
        let h = harness(1000);
        assert!(h.session.connect());
        let opened = h.connector.last();

        h.session.disconnect();
        assert_eq!(status_of(&h.session), ConnectionStatus::Disconnected);
        assert!(!opened.transport.calls().contains(&Call::Disconnect));

        let _ = opened
            .events
            .send(TransportEvent::ConnAck(ConnectReturnCode::Success));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.session.is_connected());
        assert_eq!(status_of(&h.session), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_disconnect_sequence_follows_state_machine() {
        let h = harness(1000);
        for _ in 0..3 {
            assert!(h.session.connect());
            assert_eq!(status_of(&h.session), ConnectionStatus::Connecting);
            h.session.disconnect();
            assert_eq!(status_of(&h.session), ConnectionStatus::Disconnected);
        }
        assert_eq!(h.connector.opened().len(), 3);
        // one record per (host, port)
        assert_eq!(h.store.snapshot().unwrap().connections.len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_then_reconnect_opens_new_session() {
        let h = harness(1000);
        let opened = connect_established(&h).await;

        opened
            .events
            .send(TransportEvent::Disconnected("connection reset".into()))
            .unwrap();
        let session = h.session.clone();
        wait_for(move || status_of(&session) == ConnectionStatus::Disconnected).await;
        assert!(!h.session.is_connected());

        assert!(h.session.connect());
        assert_eq!(h.connector.opened().len(), 2);
        assert_eq!(status_of(&h.session), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_rejected() {
        let h = harness(1000);
        assert!(!h.session.publish("x/y", b"hi", Qos::AtLeastOnce, false));

        assert!(h.session.connect());
        assert!(!h.session.publish("x/y", b"hi", Qos::AtLeastOnce, false));
        assert!(h.connector.last().transport.calls().is_empty());
        assert_eq!(h.store.count_all_messages().unwrap(), 0);
        assert!(h.store.find_topic("x/y").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_when_connected() {
        let h = harness(1000);
        let opened = connect_established(&h).await;

        assert!(h.session.publish("x/y", b"hi", Qos::ExactlyOnce, true));
        assert!(opened.transport.calls().contains(&Call::Publish(
            "x/y".to_string(),
            b"hi".to_vec(),
            QoS::ExactlyOnce,
            true
        )));
        // publishing does not create local records
        assert_eq!(h.store.count_all_messages().unwrap(), 0);

        opened
            .transport
            .fail_publish
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(!h.session.publish("x/y", b"hi", Qos::AtMostOnce, false));
    }

    #[tokio::test]
    async fn test_inbound_message_auto_creates_topic() {
        let h = harness(1000);
        let opened = connect_established(&h).await;

        opened
            .events
            .send(publish_event("sensor/temperature", "22.5"))
            .unwrap();
        let store = h.store.clone();
        wait_for(move || store.count_all_messages().unwrap() == 1).await;

        let topic = h.store.find_topic("sensor/temperature").unwrap().unwrap();
        assert!(!topic.is_active);
        assert_eq!(topic.qos, Qos::AtLeastOnce);
        assert_eq!(topic.description, "Auto-created topic for sensor/temperature");
        let message = h.store.latest_message(&topic).unwrap().unwrap();
        assert_eq!(message.payload_str().unwrap(), "22.5");
        assert_eq!(message.qos, Qos::AtLeastOnce);
        assert!(!message.retain);
    }

    #[tokio::test]
    async fn test_retention_keeps_latest_messages() {
        let h = harness(3);
        let opened = connect_established(&h).await;

        for i in 1..=5 {
            opened
                .events
                .send(publish_event("t", &format!("m{}", i)))
                .unwrap();
        }
        let session = h.session.clone();
        wait_for(move || {
            session
                .topic_messages("t", 1)
                .map_or(false, |page| page.messages[0].payload_text() == "m5")
        })
        .await;

        let page = h.session.topic_messages("t", 1).unwrap();
        let payloads: Vec<String> = page
            .messages
            .iter()
            .map(|m| m.payload_text().into_owned())
            .collect();
        assert_eq!(payloads, vec!["m5", "m4", "m3"]);
    }

    #[test]
    fn test_listeners_run_in_order_and_survive_failures() {
        let h = harness(1000);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        h.session.add_listener(move |_, _| {
            first.lock().unwrap().push("first");
            Ok(())
        });
        h.session
            .add_listener(|_, _| Err(ListenerError::new("listener failed")));
        let last = seen.clone();
        let id = h.session.add_listener(move |topic, message| {
            assert_eq!(topic.name, "a/b");
            assert_eq!(message.payload, b"payload".to_vec());
            last.lock().unwrap().push("last");
            Ok(())
        });

        let stored = h
            .session
            .inner
            .on_message_event("a/b", b"payload", QoS::AtMostOnce, true);
        assert!(stored.is_some());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "last"]);

        assert!(h.session.remove_listener(id));
        h.session
            .inner
            .on_message_event("a/b", b"payload", QoS::AtMostOnce, true);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "last", "first"]);
    }

    #[test]
    fn test_message_with_empty_topic_is_dropped() {
        let h = harness(1000);
        assert!(h
            .session
            .inner
            .on_message_event("", b"x", QoS::AtMostOnce, false)
            .is_none());
        assert_eq!(h.store.count_all_messages().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_topic_when_connected() {
        let h = harness(1000);
        let opened = connect_established(&h).await;

        let topic = h
            .session
            .subscribe_topic("home/lights", "Lights", Qos::AtMostOnce)
            .unwrap();
        assert!(topic.is_active);
        assert!(h.session.unsubscribe_topic("home/lights"));
        assert!(!h.session.unsubscribe_topic("home/unknown"));
        assert!(h.session.subscribe_topic("", "", Qos::AtMostOnce).is_none());

        assert_eq!(
            opened.transport.calls(),
            vec![
                Call::Subscribe("home/lights".to_string(), QoS::AtMostOnce),
                Call::Unsubscribe("home/lights".to_string()),
            ]
        );
        assert!(!h.store.find_topic("home/lights").unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_subscribe_all_requires_connection() {
        let h = harness(1000);
        add_topic(&h.store, "a", true, Qos::AtLeastOnce);
        assert_eq!(h.session.subscribe_all(), 0);

        let opened = connect_established(&h).await;
        assert_eq!(h.session.subscribe_all(), 1);
        // once on connect, once on demand
        assert_eq!(opened.transport.subscribes().len(), 2);
    }

    #[tokio::test]
    async fn test_setup_session_credentials_reach_connector() {
        let h = harness(1000);
        let credentials = Credentials::from_parts(Some("user"), Some("secret"));
        h.session.setup_session(credentials.clone());
        h.session.setup_session(credentials.clone());

        assert!(h.session.connect_to("broker.local", 8883, 30));
        let opened = h.connector.last();
        assert_eq!(opened.settings.credentials, credentials);
        assert_eq!(opened.settings.host, "broker.local");
        assert_eq!(opened.settings.port, 8883);
        assert_eq!(opened.settings.keepalive_secs, 30);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let h = harness(1000);
        let status = h.session.status();
        assert_eq!(status.status, ConnectionStatus::Disconnected);
        assert!(status.connection.is_none());

        add_topic(&h.store, "a", true, Qos::AtLeastOnce);
        let opened = connect_established(&h).await;
        opened.events.send(publish_event("b", "1")).unwrap();
        let store = h.store.clone();
        wait_for(move || store.count_all_messages().unwrap() == 1).await;

        let status = h.session.status();
        assert!(status.is_connected);
        assert_eq!(status.status, ConnectionStatus::Connected);
        assert_eq!(status.active_topics, 1);
        assert_eq!(status.total_messages, 1);
        assert!(h.session.topic_messages("missing", 1).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_worker() {
        let h = harness(1000);
        let opened = connect_established(&h).await;

        h.session.shutdown().await;
        assert!(opened.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(status_of(&h.session), ConnectionStatus::Disconnected);
    }
}
