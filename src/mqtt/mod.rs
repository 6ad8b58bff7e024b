//! # MQTT Session Module
//!
//! Client-side session management for a single MQTT 3.1.1 broker: connection lifecycle,
//! topic subscriptions, ingestion of inbound messages into a [`crate::persistence::Store`],
//! per-topic retention and in-process listener notification.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings, credentials, rumqttc options
//! ├── error.rs            - Session, transport and listener errors
//! ├── transport.rs        - Transport / EventSource / Connector seam and the rumqttc backend
//! ├── message_manager.rs  - Listener registry and fan-out
//! ├── subscription.rs     - Active-topic subscription on connect
//! ├── retention.rs        - Per-topic message history bound
//! └── mqtt_handler.rs     - SessionManager, connection state machine and I/O worker
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Broker ──► EventSource ──► worker ──► Store::create_message ──► RetentionTrimmer
//!                                  └──► CallbackRegistry::dispatch ──► listeners
//! caller ──► SessionManager::publish ──► Transport ──► Broker
//! ```
//!
//! Only one broker session exists per [`mqtt_handler::SessionManager`]. Reconnection is
//! always caller driven.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod retention;
pub mod subscription;
pub mod transport;

pub use error::{ListenerError, SessionError, TransportError};
pub use mqtt_handler::{SessionManager, SessionSettings, SessionStatus};
