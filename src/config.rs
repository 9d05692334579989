use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::EntityName;
use crate::{Error, Result};

/// Tunables of the sync layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a burst of feed events triggers one refresh
    #[serde(with = "duration_millis", rename = "debounce_ms")]
    pub debounce: Duration,

    /// Delay before an optimistic mutation is checked against the cache
    #[serde(with = "duration_millis", rename = "safety_refetch_delay_ms")]
    pub safety_refetch_delay: Duration,

    /// Storage key prefix for per-user read state
    pub read_state_key_prefix: String,

    /// Broadcast event announcing a deleted row
    pub deletion_broadcast: String,

    /// Entities the event bus opens feed channels for
    pub tracked: Vec<EntityName>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce: Duration::from_millis(500),
            safety_refetch_delay: Duration::from_secs(2),
            read_state_key_prefix: "notifications_read".to_string(),
            deletion_broadcast: "record_deleted".to_string(),
            tracked: EntityName::ALL.to_vec(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_state_key_prefix.trim().is_empty() {
            return Err(Error::Config("read_state_key_prefix must not be empty".to_string()));
        }
        if self.deletion_broadcast.trim().is_empty() {
            return Err(Error::Config("deletion_broadcast must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_safety_refetch_delay(mut self, delay: Duration) -> Self {
        self.safety_refetch_delay = delay;
        self
    }

    pub fn with_read_state_key_prefix(mut self, prefix: &str) -> Self {
        self.read_state_key_prefix = prefix.to_string();
        self
    }

    pub fn with_tracked(mut self, tracked: Vec<EntityName>) -> Self {
        self.tracked = tracked;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
