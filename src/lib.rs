mod config;
pub mod data;
mod error;
pub mod notify;

#[cfg(test)]
mod test;

pub use config::SyncConfig;
pub use data::{
    BulkDeleteOutcome, CachePhase, CacheSpec, ChangeAction, ChangeEvent, ChangeFeed, EntityCache,
    EntityName, EventBus, JoinShape, MemoryChangeFeed, MutationBackend, Optimistic,
    OptimisticChange, Record, SnapshotSource, SortKey, SortOrder, Subscription,
};
pub use error::{Error, Result};
pub use notify::{
    FileStorage, KeyValueStorage, MemoryStorage, NotificationCenter, NotificationId,
    NotificationItem, NotificationKind, NotificationSource, Priority, ReadSet,
};

#[doc(hidden)]
pub use serde_json as __json;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
/// Listener panics are caught outside of every lock, so the state behind a
/// poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Build a change event with minimal syntax
///
/// # Example
///
/// ```
/// use escola_sync::{change, record, ChangeAction, EntityName};
///
/// let event = change!(Update, EntityName::Recados, record! { "id" => "a", "ts" => 3 });
/// assert_eq!(event.action, ChangeAction::Update);
/// assert_eq!(event.record_id().as_deref(), Some("a"));
/// ```
#[macro_export]
macro_rules! change {
    (Insert, $entity:expr, $record:expr) => {
        $crate::ChangeEvent::insert($entity, $record)
    };
    (Update, $entity:expr, $record:expr) => {
        $crate::ChangeEvent::update($entity, $record)
    };
    (Delete, $entity:expr, id = $id:expr) => {
        $crate::ChangeEvent::delete($entity, $crate::record! { "id" => $id })
    };
    (Delete, $entity:expr, $record:expr) => {
        $crate::ChangeEvent::delete($entity, $record)
    };
}
