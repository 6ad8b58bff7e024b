use std::sync::Arc;
use tracing::debug;

use crate::persistence::{Store, StoreError, Topic};

/// Default upper bound of stored messages per topic.
pub const DEFAULT_MAX_STORED_MESSAGES: usize = 1000;

/// Keeps each topic's stored history at or below a fixed size, dropping oldest first.
///
/// Count and delete are separate store calls. A concurrent insert between them can leave
/// the topic one or two messages over the bound until the next trim; the trimmer never
/// deletes more than the excess it observed.
#[derive(Clone)]
pub struct RetentionTrimmer {
    store: Arc<dyn Store>,
    max_stored: usize,
}

impl RetentionTrimmer {
    pub fn new(store: Arc<dyn Store>, max_stored: usize) -> Self {
        Self { store, max_stored }
    }

    pub fn max_stored(&self) -> usize {
        self.max_stored
    }

    /// Returns the number of deleted messages.
    pub fn trim(&self, topic: &Topic) -> Result<usize, StoreError> {
        let count = self.store.count_messages(topic)?;
        if count <= self.max_stored {
            return Ok(0);
        }

        let deleted = self.store.delete_oldest_messages(topic, self.max_stored)?;
        debug!(
            "Trimmed {} old messages from {} (limit {})",
            deleted, topic.name, self.max_stored
        );
        Ok(deleted)
    }
}
