use serde::{Deserialize, Serialize};

use crate::data::{now, EntityName, Record, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// Row-level change delivered by the change feed.
///
/// INSERT and UPDATE carry the full current row in `new_record`. DELETE carries
/// the key in `old_record`, or in `new_record` when the feed omits the old row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityName,
    pub action: ChangeAction,
    pub new_record: Option<Record>,
    pub old_record: Option<Record>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: Timestamp,
}

impl ChangeEvent {
    pub fn insert(entity: EntityName, record: Record) -> Self {
        ChangeEvent {
            entity,
            action: ChangeAction::Insert,
            new_record: Some(record),
            old_record: None,
            received_at: now(),
        }
    }

    pub fn update(entity: EntityName, record: Record) -> Self {
        ChangeEvent {
            entity,
            action: ChangeAction::Update,
            new_record: Some(record),
            old_record: None,
            received_at: now(),
        }
    }

    pub fn delete(entity: EntityName, old_record: Record) -> Self {
        ChangeEvent {
            entity,
            action: ChangeAction::Delete,
            new_record: None,
            old_record: Some(old_record),
            received_at: now(),
        }
    }

    /// Key of the affected row. DELETE prefers the old row's id.
    pub fn record_id(&self) -> Option<String> {
        match self.action {
            ChangeAction::Delete => self
                .old_record
                .as_ref()
                .and_then(Record::id)
                .or_else(|| self.new_record.as_ref().and_then(Record::id)),
            ChangeAction::Insert | ChangeAction::Update => {
                self.new_record.as_ref().and_then(Record::id)
            }
        }
    }
}
