use std::sync::Mutex;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::data::{ChangeEvent, EntityName};
use crate::{lock, Error, Result};

/// Sender half handed to the feed for row-level events of one entity
pub type ChangeEventSender = mpsc::UnboundedSender<ChangeEvent>;

/// Sender half handed to the feed for broadcast signals
pub type BroadcastSender = mpsc::UnboundedSender<BroadcastMessage>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new() -> Self {
        ChannelId(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport delivering live changes, implemented outside this crate
/// (websocket realtime client, database listener, ...).
///
/// Events pushed into a channel's sender must keep the order in which the
/// feed emitted them. Broadcasts are delivered to every open broadcast
/// channel, the publisher's included.
pub trait ChangeFeed: Send + Sync {
    fn open_channel(&self, entity: EntityName, sender: ChangeEventSender) -> Result<ChannelId>;

    fn open_broadcast(&self, sender: BroadcastSender) -> Result<ChannelId>;

    fn close_channel(&self, channel: ChannelId);

    fn broadcast(&self, message: BroadcastMessage) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryFeedState {
    channels: AHashMap<ChannelId, (EntityName, ChangeEventSender)>,
    broadcasts: AHashMap<ChannelId, BroadcastSender>,
    opened: usize,
}

/// In-process change feed. Used by tests and by embedders that produce
/// changes locally.
#[derive(Debug, Default)]
pub struct MemoryChangeFeed {
    state: Mutex<MemoryFeedState>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an event to every channel open for its entity.
    /// Returns the number of channels that accepted it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let state = lock(&self.state);
        state
            .channels
            .values()
            .filter(|(entity, _)| *entity == event.entity)
            .filter(|(_, sender)| sender.send(event.clone()).is_ok())
            .count()
    }

    /// Number of channels currently open, broadcast channels included
    pub fn open_channels(&self) -> usize {
        let state = lock(&self.state);
        state.channels.len() + state.broadcasts.len()
    }

    /// Number of channels ever opened on this feed
    pub fn total_opened(&self) -> usize {
        let state = lock(&self.state);
        state.opened
    }
}

impl ChangeFeed for MemoryChangeFeed {
    fn open_channel(&self, entity: EntityName, sender: ChangeEventSender) -> Result<ChannelId> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| Error::Feed(e.to_string()))?;
        let id = ChannelId::new();
        state.channels.insert(id, (entity, sender));
        state.opened += 1;
        Ok(id)
    }

    fn open_broadcast(&self, sender: BroadcastSender) -> Result<ChannelId> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| Error::Feed(e.to_string()))?;
        let id = ChannelId::new();
        state.broadcasts.insert(id, sender);
        state.opened += 1;
        Ok(id)
    }

    fn close_channel(&self, channel: ChannelId) {
        if let Ok(mut state) = self.state.lock() {
            state.channels.remove(&channel);
            state.broadcasts.remove(&channel);
        }
    }

    fn broadcast(&self, message: BroadcastMessage) -> Result<()> {
        let state = self
            .state
            .lock()
            .map_err(|e| Error::Feed(e.to_string()))?;
        for sender in state.broadcasts.values() {
            let _ = sender.send(message.clone());
        }
        Ok(())
    }
}
