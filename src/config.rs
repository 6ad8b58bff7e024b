//! Application configuration loaded from a TOML file.
//!
//! Every section and key is optional. A missing file means "all defaults", and
//! [`AppConfig::ensure_default_config`] writes the defaults out on first start so they can
//! be edited.

use crate::mqtt::config::{default_client_id, BrokerSettings, Credentials};
use crate::mqtt::mqtt_handler::SessionSettings;
use crate::mqtt::retention::DEFAULT_MAX_STORED_MESSAGES;
use crate::persistence::Qos;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn, Level};

const APP_DIR: &str = "mqttdash";
const CONFIG_FILE: &str = "config.toml";
const SNAPSHOT_FILE: &str = "store.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    /// Defaults to `mqttdash-<pid>`
    pub client_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive_secs: 60,
            client_id: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Connect in the background shortly after startup instead of inline
    pub auto_connect: bool,
    pub auto_connect_delay_secs: u64,
    pub max_stored_messages: usize,
    pub default_qos: Qos,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_connect: false,
            auto_connect_delay_secs: 2,
            max_stored_messages: DEFAULT_MAX_STORED_MESSAGES,
            default_qos: Qos::AtLeastOnce,
            request_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub snapshot_path: Option<PathBuf>,
    pub autosave_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            autosave_interval_secs: 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn default_config_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(APP_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn default_snapshot_path() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| {
            warn!("Could not determine data directory, using current directory");
            PathBuf::from(".")
        });
        path.push(APP_DIR);
        path.push(SNAPSHOT_FILE);
        path
    }

    /// Writes a default configuration to `path` unless a file already exists there.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        Self::default().save(path).await
    }

    /// Loads the configuration at `path`, falling back to defaults if it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.store
            .snapshot_path
            .clone()
            .unwrap_or_else(Self::default_snapshot_path)
    }

    pub fn log_level(&self) -> Result<Level> {
        Level::from_str(self.logging.level.trim())
            .map_err(|e| eyre!("Invalid log level {:?}: {}", self.logging.level, e))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(
            self.broker.username.as_deref(),
            self.broker.password.as_deref(),
        )
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            broker: BrokerSettings {
                host: self.broker.host.clone(),
                port: self.broker.port,
                keepalive_secs: self.broker.keepalive_secs,
                client_id: self
                    .broker
                    .client_id
                    .clone()
                    .unwrap_or_else(default_client_id),
                credentials: self.credentials(),
                request_capacity: self.session.request_capacity,
            },
            max_stored_messages: self.session.max_stored_messages,
            default_qos: self.session.default_qos,
        }
    }
}
