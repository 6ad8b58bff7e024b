use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use mqttdash::config::AppConfig;
use mqttdash::mqtt::SessionManager;
use mqttdash::persistence::snapshot::load_store;
use mqttdash::service::{Service, StartOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Persistent MQTT client session with local message history
#[derive(Parser, Debug)]
#[command(name = "mqttdash")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Keepalive interval in seconds
    #[arg(long)]
    keepalive: Option<u64>,

    /// Subscribe all active topics once connected
    #[arg(long)]
    auto_subscribe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Store snapshot file
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
        if let Some(username) = &self.username {
            config.broker.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.broker.password = Some(password.clone());
        }
        if let Some(keepalive) = self.keepalive {
            config.broker.keepalive_secs = keepalive;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(snapshot) = &self.snapshot {
            config.store.snapshot_path = Some(snapshot.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let path = AppConfig::default_config_path();
            AppConfig::ensure_default_config(&path).await?;
            path
        }
    };
    let mut config = AppConfig::load(&config_path).await?;
    cli.apply_overrides(&mut config);
    setup_logging_env(config.log_level()?);
    info!("Using configuration {}", config_path.display());

    let snapshot_path = config.snapshot_path();
    let store = Arc::new(load_store(&snapshot_path).await?);
    let session = SessionManager::with_mqtt(config.session_settings(), store.clone());

    let options = StartOptions {
        auto_subscribe: cli.auto_subscribe,
        auto_connect_delay: config
            .session
            .auto_connect
            .then(|| Duration::from_secs(config.session.auto_connect_delay_secs)),
        autosave_interval_secs: config.store.autosave_interval_secs,
    };

    let running = Service::create(session, store, snapshot_path)
        .start(&options)
        .await
        .map_err(|e| eyre!("Failed to start MQTT session: {}", e))?;

    shutdown_signal().await;
    info!("Shutdown signal received; commencing graceful shutdown");

    let stopped = running.shutdown().await;
    let status = stopped.status();
    info!(
        "Stopped with {} stored messages across {} active topics",
        status.total_messages, status.active_topics
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for shutdown signal: {}", e);
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_config_values() {
        let cli = Cli::try_parse_from([
            "mqttdash",
            "--host",
            "broker.local",
            "--port",
            "8883",
            "--username",
            "user",
            "--password",
            "secret",
            "--keepalive",
            "15",
            "--auto-subscribe",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);

        assert!(cli.auto_subscribe);
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.keepalive_secs, 15);
        assert!(config.credentials().is_some());
        assert_eq!(config.log_level().unwrap(), Level::DEBUG);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::try_parse_from(["mqttdash"]).unwrap();
        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config, AppConfig::default());
        assert!(!cli.auto_subscribe);
    }
}
