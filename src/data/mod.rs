mod backend;
mod change_event;
mod change_feed;
mod entity_cache;
mod event_bus;
mod optimistic;
mod record;

pub use backend::{BulkDeleteOutcome, JoinShape, MutationBackend, Relation, SnapshotSource};
pub use change_event::{ChangeAction, ChangeEvent};
pub use change_feed::{
    BroadcastMessage, BroadcastSender, ChangeEventSender, ChangeFeed, ChannelId, MemoryChangeFeed,
};
pub use entity_cache::{CachePhase, CacheSpec, ChangeListener, EntityCache, SortKey, SortOrder};
pub use event_bus::{BroadcastHandler, EventBus, EventCallback, Subscription};
pub use optimistic::{Optimistic, OptimisticChange};
pub use record::Record;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// The tracked server-backed collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum EntityName {
    Recados,
    Materiais,
    ProvasTarefas,
    Notas,
}

impl EntityName {
    pub const ALL: [EntityName; 4] = [
        EntityName::Recados,
        EntityName::Materiais,
        EntityName::ProvasTarefas,
        EntityName::Notas,
    ];

    /// Table name as known by the change feed and the backend
    pub fn table(&self) -> &'static str {
        match self {
            EntityName::Recados => "recados",
            EntityName::Materiais => "materiais",
            EntityName::ProvasTarefas => "provas_tarefas",
            EntityName::Notas => "notas",
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityName::ALL
            .into_iter()
            .find(|entity| entity.table() == s)
            .ok_or_else(|| Error::Config(format!("unknown entity '{}'", s)))
    }
}

pub type Timestamp = time::OffsetDateTime;

pub fn now() -> Timestamp {
    time::OffsetDateTime::now_utc()
}

pub fn epoch() -> Timestamp {
    time::OffsetDateTime::UNIX_EPOCH
}

pub fn millis_to_timestamp(millis: u64) -> Timestamp {
    epoch() + time::Duration::milliseconds(millis as i64)
}

/// Parse an RFC 3339 timestamp as stored in record columns
pub fn parse_timestamp(value: &str) -> Option<Timestamp> {
    time::OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339).ok()
}
