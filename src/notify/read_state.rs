use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ahash::{AHashMap, AHashSet};
use serde_json::Value as JsonValue;

use crate::{lock, Error, Result};

/// Per-key JSON storage the read state is persisted in
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    fn set(&self, key: &str, value: JsonValue) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<AHashMap<String, JsonValue>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: JsonValue) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string(&value)?;
        std::fs::write(self.path_for(key), contents)?;
        Ok(())
    }
}

/// Notification ids the active user has marked read.
///
/// Stored as a JSON array under `"<prefix>_<user id>"`. Without a user the
/// set lives only in memory. Storage failures are logged and otherwise
/// ignored, so read state degrades to the current session.
pub struct ReadSet {
    storage: Arc<dyn KeyValueStorage>,
    prefix: String,
    user: Option<String>,
    ids: AHashSet<String>,
}

impl std::fmt::Debug for ReadSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSet")
            .field("prefix", &self.prefix)
            .field("user", &self.user)
            .field("ids", &self.ids.len())
            .finish()
    }
}

impl ReadSet {
    pub fn load(storage: Arc<dyn KeyValueStorage>, prefix: &str, user: Option<&str>) -> Self {
        let mut read_set = ReadSet {
            storage,
            prefix: prefix.to_string(),
            user: None,
            ids: AHashSet::new(),
        };
        read_set.switch_user(user);
        read_set
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn storage_key(&self) -> Option<String> {
        self.user
            .as_ref()
            .map(|user| format!("{}_{}", self.prefix, user))
    }

    /// Drop the current ids and load the ones stored for `user`.
    /// Returns false when `user` is already active.
    pub fn switch_user(&mut self, user: Option<&str>) -> bool {
        if self.user.is_some() && self.user.as_deref() == user {
            return false;
        }

        self.user = user.map(str::to_string);
        self.ids.clear();

        let Some(key) = self.storage_key() else {
            return true;
        };
        match self.storage.get(&key) {
            Ok(Some(JsonValue::Array(values))) => {
                self.ids = values
                    .into_iter()
                    .filter_map(|value| value.as_str().map(str::to_string))
                    .collect();
            }
            Ok(Some(other)) => log::warn!("Ignoring malformed read state under '{}': {}", key, other),
            Ok(None) => {}
            Err(e) => log::warn!("Could not load read state '{}': {}", key, e),
        }
        log::debug!("Loaded {} read notifications for '{}'", self.ids.len(), key);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.ids.iter()
    }

    pub fn insert(&mut self, id: &str) -> bool {
        let inserted = self.ids.insert(id.to_string());
        if inserted {
            self.persist();
        }
        inserted
    }

    pub fn insert_many<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.ids.len();
        self.ids.extend(ids);
        let added = self.ids.len() - before;
        if added > 0 {
            self.persist();
        }
        added
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.ids.remove(id);
        if removed {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        let Some(key) = self.storage_key() else {
            return;
        };
        let mut ids: Vec<&String> = self.ids.iter().collect();
        ids.sort();
        let value = JsonValue::Array(ids.into_iter().map(|id| JsonValue::String(id.clone())).collect());
        if let Err(e) = self.storage.set(&key, value) {
            log::warn!("Read state for '{}' kept in memory only: {}", key, e);
        }
    }
}
