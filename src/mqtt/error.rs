//! Error definitions for the MQTT session

use crate::persistence::StoreError;
use thiserror::Error;

/// Errors raised inside the session.
///
/// None of these cross a public session operation or an event handler: operations turn
/// them into `false`/`None` plus a log line, handlers log them and carry on.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Network or authentication failure while connecting
    #[error("Transport connect error: {0}")]
    TransportConnect(String),

    /// The transport refused to accept a publish
    #[error("Transport publish error: {0}")]
    TransportPublish(#[from] TransportError),

    /// A payload could not be decoded as text
    #[error("Decode error: {0}")]
    Decode(String),

    /// A registered listener failed
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not connected to broker")]
    NotConnected,

    /// `connect()` was called outside of a tokio runtime
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

/// Errors reported by a [`super::transport::Transport`] when submitting a request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Failed to open transport session: {0}")]
    Open(String),
}

/// Error returned by a message listener.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
