//! Transport seam between the session and the MQTT protocol client.
//!
//! The session never touches rumqttc directly. It asks a [`Connector`] for a
//! [`TransportSession`], which is two halves:
//!
//! ```text
//! Transport   (Arc, shared)  ── subscribe / unsubscribe / publish / disconnect requests
//! EventSource (owned)        ── inbound TransportEvents, drained by the session worker
//! ```
//!
//! Requests are submitted without waiting for the network; their acknowledgements arrive
//! later as events. `MqttConnector` backs both halves with rumqttc's `AsyncClient` and
//! `EventLoop`. The event source never reconnects: the first transport error ends it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
    SubscribeFilter, SubscribeReasonCode,
};
use tracing::{debug, trace, warn};

use super::config::BrokerSettings;
use super::error::TransportError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How long `close` waits for the DISCONNECT packet to be flushed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbound events produced by an [`EventSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// CONNACK received (or connection refused with this code)
    ConnAck(ConnectReturnCode),
    /// The connection attempt failed before any CONNACK
    ConnectFailed(String),
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    SubAck {
        pkid: u16,
        return_codes: Vec<SubscribeReasonCode>,
    },
    /// PUBACK for QoS 1 or PUBCOMP for QoS 2
    PubAck { pkid: u16 },
    /// An established connection was lost or closed
    Disconnected(String),
}

/// Request half of a transport session.
pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Submits one SUBSCRIBE carrying every filter in `filters`.
    fn subscribe_many(&self, filters: &[(String, QoS)]) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Submits a publish. `Ok` means the request was accepted for sending.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;
}

/// Event half of a transport session. Driven by exactly one worker.
pub trait EventSource: Send {
    /// Waits for the next event. `None` once the session has ended.
    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>>;

    /// Flushes pending outgoing requests (e.g. DISCONNECT) and ends the session.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub struct TransportSession {
    pub transport: Arc<dyn Transport>,
    pub events: Box<dyn EventSource>,
}

/// Opens transport sessions. Opening performs no network I/O; the connection is made
/// once the event source is first polled.
pub trait Connector: Send + Sync {
    fn open(&self, settings: &BrokerSettings) -> Result<TransportSession, TransportError>;
}

impl Transport for AsyncClient {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.try_subscribe(topic, qos)?;
        Ok(())
    }

    fn subscribe_many(&self, filters: &[(String, QoS)]) -> Result<(), TransportError> {
        self.try_subscribe_many(
            filters
                .iter()
                .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos)),
        )?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.try_publish(topic, qos, retain, payload.to_vec())?;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.try_disconnect()?;
        Ok(())
    }
}

/// rumqttc event loop adapter.
pub struct MqttEventSource {
    event_loop: EventLoop,
    connected: bool,
    finished: bool,
}

impl MqttEventSource {
    pub fn new(event_loop: EventLoop) -> Self {
        Self {
            event_loop,
            connected: false,
            finished: false,
        }
    }

    /// Maps one poll result. `None` means the event is not interesting to the session.
    fn translate(
        &mut self,
        polled: Result<Event, ConnectionError>,
    ) -> Option<TransportEvent> {
        match polled {
            Ok(Event::Incoming(packet)) => match packet {
                Packet::ConnAck(conn_ack) => {
                    if conn_ack.code == ConnectReturnCode::Success {
                        self.connected = true;
                    } else {
                        self.finished = true;
                    }
                    Some(TransportEvent::ConnAck(conn_ack.code))
                }
                Packet::Publish(publish) => Some(TransportEvent::Publish {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    qos: publish.qos,
                    retain: publish.retain,
                }),
                Packet::SubAck(sub_ack) => Some(TransportEvent::SubAck {
                    pkid: sub_ack.pkid,
                    return_codes: sub_ack.return_codes,
                }),
                Packet::PubAck(pub_ack) => Some(TransportEvent::PubAck { pkid: pub_ack.pkid }),
                Packet::PubComp(pub_comp) => {
                    Some(TransportEvent::PubAck { pkid: pub_comp.pkid })
                }
                Packet::Disconnect => {
                    self.finished = true;
                    Some(TransportEvent::Disconnected(
                        "Disconnected by broker".to_string(),
                    ))
                }
                other => {
                    trace!("Incoming packet: {:?}", other);
                    None
                }
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                self.finished = true;
                Some(TransportEvent::Disconnected(
                    "Disconnect requested by client".to_string(),
                ))
            }
            Ok(Event::Outgoing(outgoing)) => {
                trace!("Outgoing packet: {:?}", outgoing);
                None
            }
            Err(ConnectionError::ConnectionRefused(code)) if !self.connected => {
                self.finished = true;
                Some(TransportEvent::ConnAck(code))
            }
            Err(e) => {
                self.finished = true;
                if self.connected {
                    Some(TransportEvent::Disconnected(e.to_string()))
                } else {
                    Some(TransportEvent::ConnectFailed(e.to_string()))
                }
            }
        }
    }
}

impl EventSource for MqttEventSource {
    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>> {
        Box::pin(async move {
            while !self.finished {
                let polled = self.event_loop.poll().await;
                if let Some(event) = self.translate(polled) {
                    return Some(event);
                }
            }
            None
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.finished || !self.connected {
                self.finished = true;
                return;
            }

            let event_loop = &mut self.event_loop;
            let flush = async move {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(event) => trace!("Draining event before close: {:?}", event),
                    }
                }
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
                warn!("Timed out flushing DISCONNECT to broker");
            }
            self.finished = true;
            debug!("MQTT event loop closed");
        })
    }
}

/// Connector backed by rumqttc.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    fn open(&self, settings: &BrokerSettings) -> Result<TransportSession, TransportError> {
        if settings.host.trim().is_empty() {
            return Err(TransportError::Open("broker host is empty".to_string()));
        }

        let (client, event_loop) =
            AsyncClient::new(settings.to_mqtt_options(), settings.request_capacity.max(1));
        debug!(
            "Opened MQTT client for {}:{} (keepalive {}s)",
            settings.host, settings.port, settings.keepalive_secs
        );

        Ok(TransportSession {
            transport: Arc::new(client),
            events: Box::new(MqttEventSource::new(event_loop)),
        })
    }
}
