//! TOML snapshots of a [`MemoryStore`].
//!
//! The CLI keeps its records in memory and writes the whole store to a single TOML file:
//! once at startup (load), periodically from an autosave task and once more at shutdown.

use super::memory_store::{MemoryStore, StoreSnapshot};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Loads a store from `path`. A missing file yields an empty store.
pub async fn load_store(path: &Path) -> Result<MemoryStore> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if snapshot file exists: {}", e))?
    {
        warn!(
            "Snapshot file {} does not exist, starting with an empty store",
            path.display()
        );
        return Ok(MemoryStore::new());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| eyre!("Failed to read snapshot file: {}", e))?;
    let snapshot: StoreSnapshot =
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse snapshot file: {}", e))?;

    info!(
        "Loaded {} topics, {} messages and {} connection records from {}",
        snapshot.topics.len(),
        snapshot.messages.len(),
        snapshot.connections.len(),
        path.display()
    );
    Ok(MemoryStore::from_snapshot(snapshot))
}

/// Writes the full contents of `store` to `path`, creating parent directories.
pub async fn save_store(store: &MemoryStore, path: &Path) -> Result<()> {
    let snapshot = store
        .snapshot()
        .map_err(|e| eyre!("Failed to snapshot store: {}", e))?;
    let content = toml::to_string_pretty(&snapshot)
        .map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|e| eyre!("Failed to write snapshot file: {}", e))?;

    debug!("Store snapshot written to {}", path.display());
    Ok(())
}

/// Saves `store` to `path` every `interval_seconds` until the task is aborted.
pub fn start_autosave_task(
    store: Arc<MemoryStore>,
    path: PathBuf,
    interval_seconds: u64,
) -> JoinHandle<()> {
    info!("Starting autosave task with interval: {}s", interval_seconds);

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));
        // first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            if let Err(e) = save_store(&store, &path).await {
                error!("Failed to autosave store: {}", e);
            } else {
                debug!("Store autosaved successfully");
            }
        }
    })
}
