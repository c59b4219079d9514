// Channel name -> open log map.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::log::{Log, LogConfig};
use crate::{LogError, Result};

/// Channel names separate from file numbers with a dash, so they must not
/// contain one themselves.
pub fn validate_channel_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.is_ascii() || name.contains('-') {
        return Err(LogError::BadChannelName(name.to_string()));
    }
    Ok(())
}

/// Shared registry of open channel logs.
pub struct LogRegistry {
    config: LogConfig,
    logs: RwLock<HashMap<String, Arc<Log>>>,
}

impl LogRegistry {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Get an open log without creating one.
    pub async fn get(&self, channel: &str) -> Option<Arc<Log>> {
        self.logs.read().await.get(channel).cloned()
    }

    /// Get the channel's log, opening (and creating) it on first use.
    pub async fn open(&self, channel: &str) -> Result<Arc<Log>> {
        validate_channel_name(channel)?;
        if let Some(log) = self.logs.read().await.get(channel) {
            return Ok(Arc::clone(log));
        }
        let mut guard = self.logs.write().await;
        // Re-check under the write lock; another task may have opened it.
        if let Some(log) = guard.get(channel) {
            return Ok(Arc::clone(log));
        }
        let log = Log::open(self.config.clone(), channel).await?;
        guard.insert(channel.to_string(), Arc::clone(&log));
        Ok(log)
    }
}
