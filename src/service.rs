//! Process lifecycle around one [`SessionManager`], as a statum typestate machine.
//!
//! ```text
//! Service<Idle> ──start()──► Service<Running> ──shutdown()──► Service<Stopped>
//! ```
//!
//! `start` issues the initial connect (inline, or as a delayed task when auto-connect is
//! configured) and starts the snapshot autosave. `shutdown` disconnects, stops the
//! background tasks and writes the final snapshot.

use crate::mqtt::mqtt_handler::{SessionManager, SessionStatus};
use crate::persistence::memory_store::MemoryStore;
use crate::persistence::snapshot::{save_store, start_autosave_task};
use statum::{machine, state};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound for waiting on CONNACK before an explicit subscribe-all.
const CONNECT_WAIT: Duration = Duration::from_secs(10);
const CONNECT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Initial connect to {host}:{port} could not be issued")]
    ConnectFailed { host: String, port: u16 },
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Subscribe all active topics once the connection is up
    pub auto_subscribe: bool,
    /// Connect from a background task after this delay instead of inline
    pub auto_connect_delay: Option<Duration>,
    pub autosave_interval_secs: u64,
}

#[state]
#[derive(Debug, Clone)]
pub enum ServiceState {
    Idle,
    Running,
    Stopped,
}

#[machine]
pub struct Service<S: ServiceState> {
    session: SessionManager,
    store: Arc<MemoryStore>,
    snapshot_path: PathBuf,
    autosave: Option<JoinHandle<()>>,
    auto_connect: Option<JoinHandle<()>>,
}

impl<S: ServiceState> Service<S> {
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }
}

impl Service<Idle> {
    pub fn create(session: SessionManager, store: Arc<MemoryStore>, snapshot_path: PathBuf) -> Self {
        Self::new(session, store, snapshot_path, None, None)
    }

    pub async fn start(mut self, options: &StartOptions) -> Result<Service<Running>, ServiceError> {
        match options.auto_connect_delay {
            Some(delay) => {
                self.auto_connect = Some(schedule_auto_connect(
                    self.session.clone(),
                    delay,
                    options.auto_subscribe,
                ));
            }
            None => {
                if !connect_session(&self.session) {
                    let broker = &self.session.settings().broker;
                    return Err(ServiceError::ConnectFailed {
                        host: broker.host.clone(),
                        port: broker.port,
                    });
                }
                if options.auto_subscribe {
                    subscribe_when_connected(&self.session).await;
                }
            }
        }

        if options.autosave_interval_secs > 0 {
            self.autosave = Some(start_autosave_task(
                self.store.clone(),
                self.snapshot_path.clone(),
                options.autosave_interval_secs,
            ));
        }

        info!("Service running");
        Ok(self.transition())
    }
}

impl Service<Running> {
    pub async fn shutdown(mut self) -> Service<Stopped> {
        info!("Shutting down service");

        if let Some(task) = self.auto_connect.take() {
            task.abort();
        }
        self.session.shutdown().await;

        if let Some(task) = self.autosave.take() {
            task.abort();
        }
        if let Err(e) = save_store(&self.store, &self.snapshot_path).await {
            error!("Failed to save final snapshot: {}", e);
        } else {
            info!("Final snapshot saved to {}", self.snapshot_path.display());
        }

        self.transition()
    }
}

impl Service<Stopped> {}

fn connect_session(session: &SessionManager) -> bool {
    session.setup_session(session.settings().broker.credentials.clone());
    session.connect()
}

/// Waits up to [`CONNECT_WAIT`] for the session to come up, then subscribes all active
/// topics.
async fn subscribe_when_connected(session: &SessionManager) {
    let connected = tokio::time::timeout(CONNECT_WAIT, async {
        while !session.is_connected() {
            tokio::time::sleep(CONNECT_POLL).await;
        }
    })
    .await
    .is_ok();

    if connected {
        let issued = session.subscribe_all();
        info!("Subscribed {} active topics", issued);
    } else {
        warn!("Session not connected, skipping subscribe-all");
    }
}

/// Issues the initial connect from a background task after `delay`.
pub fn schedule_auto_connect(
    session: SessionManager,
    delay: Duration,
    auto_subscribe: bool,
) -> JoinHandle<()> {
    info!("Scheduling auto-connect in {:?}", delay);

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        if !connect_session(&session) {
            error!("Auto-connect to MQTT broker failed");
            return;
        }
        if auto_subscribe {
            subscribe_when_connected(&session).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mqtt_handler::SessionSettings;
    use crate::mqtt::transport::testing::FakeConnector;
    use crate::mqtt::transport::TransportEvent;
    use crate::persistence::{ConnectionStatus, Qos, Store, TopicDefaults};
    use rumqttc::ConnectReturnCode;
    use std::sync::atomic::Ordering;

    struct Fixture {
        service: Service<Idle>,
        store: Arc<MemoryStore>,
        connector: Arc<FakeConnector>,
        _dir: tempfile::TempDir,
        snapshot: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("store.toml");
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(FakeConnector::default());
        let session = SessionManager::new(
            SessionSettings::default(),
            store.clone(),
            connector.clone(),
        );
        Fixture {
            service: Service::create(session, store.clone(), snapshot.clone()),
            store,
            connector,
            _dir: dir,
            snapshot,
        }
    }

    fn ack_when_opened(connector: Arc<FakeConnector>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(opened) = connector.opened().last() {
                    opened
                        .events
                        .send(TransportEvent::ConnAck(ConnectReturnCode::Success))
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let f = fixture();
        let running = f.service.start(&StartOptions::default()).await.unwrap();
        assert_eq!(running.status().status, ConnectionStatus::Connecting);
        assert_eq!(f.connector.opened().len(), 1);

        let stopped = running.shutdown().await;
        assert_eq!(stopped.status().status, ConnectionStatus::Disconnected);
        assert!(f.snapshot.exists());
        assert!(f.connector.last().closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_initial_connect_is_an_error() {
        let f = fixture();
        f.connector.fail_open.store(true, Ordering::SeqCst);

        let result = f.service.start(&StartOptions::default()).await;
        assert!(matches!(
            result,
            Err(ServiceError::ConnectFailed { port: 1883, .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_subscribe_after_connack() {
        let f = fixture();
        f.store
            .get_or_create_topic(
                "home/+/state",
                TopicDefaults {
                    description: String::new(),
                    is_active: Some(true),
                    qos: Some(Qos::AtLeastOnce),
                },
            )
            .unwrap();

        let acker = ack_when_opened(f.connector.clone());
        let options = StartOptions {
            auto_subscribe: true,
            ..Default::default()
        };
        let running = f.service.start(&options).await.unwrap();
        acker.await.unwrap();

        assert!(running.session().is_connected());
        // once from the CONNACK handler, once explicitly
        assert_eq!(f.connector.last().transport.subscribes().len(), 2);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_delayed_auto_connect() {
        let f = fixture();
        let options = StartOptions {
            auto_connect_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let running = f.service.start(&options).await.unwrap();
        assert!(f.connector.opened().is_empty());

        for _ in 0..200 {
            if !f.connector.opened().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.connector.opened().len(), 1);
        assert_eq!(running.status().status, ConnectionStatus::Connecting);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_delayed_auto_connect_failure_is_not_fatal() {
        let f = fixture();
        f.connector.fail_open.store(true, Ordering::SeqCst);
        let options = StartOptions {
            auto_connect_delay: Some(Duration::from_millis(1)),
            ..Default::default()
        };
        let running = f.service.start(&options).await.unwrap();

        for _ in 0..200 {
            if running.session().connection_record().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(running.status().status, ConnectionStatus::Error);
        running.shutdown().await;
    }
}
