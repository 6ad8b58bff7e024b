//! # mqttdash
//!
//! Persistent MQTT client session: one broker connection with a tracked lifecycle,
//! subscription of the operator's active topics, retention-bounded message history and
//! in-process listeners for every delivered message.
//!
//! The binary (`src/main.rs`) wires these pieces into a small CLI harness. Other front
//! ends (an HTTP layer, a dashboard) are expected to hold a cloned
//! [`mqtt::SessionManager`] and call its operations directly.

pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod service;
