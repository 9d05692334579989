use std::sync::Arc;
use std::time::Duration;

use crate::data::{ChangeEvent, EntityCache, EntityName, MutationBackend, Record};
use crate::{Error, Result, SyncConfig};

/// A local edit applied to a cache before the backend confirms it.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticChange {
    Upsert(Record),
    Remove(String),
}

impl OptimisticChange {
    pub(crate) fn to_event(&self, entity: EntityName) -> ChangeEvent {
        match self {
            OptimisticChange::Upsert(record) => ChangeEvent::update(entity, record.clone()),
            OptimisticChange::Remove(id) => {
                ChangeEvent::delete(entity, crate::record! { "id" => id })
            }
        }
    }
}

/// Runs mutations against the backend with the local cache updated first.
///
/// Each operation applies its change at once, then reconciles with the
/// backend answer: success installs the server's row, failure rolls back.
/// Both only touch the row if it still holds the optimistic value, since a
/// live event may already have delivered the authoritative state. A delayed
/// check refetches the cache when no such state has shown up.
pub struct Optimistic {
    cache: Arc<EntityCache>,
    backend: Arc<dyn MutationBackend>,
    safety_delay: Duration,
}

impl std::fmt::Debug for Optimistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimistic")
            .field("entity", &self.cache.entity())
            .field("safety_delay", &self.safety_delay)
            .finish()
    }
}

impl Optimistic {
    pub fn new(
        cache: Arc<EntityCache>,
        backend: Arc<dyn MutationBackend>,
        config: &SyncConfig,
    ) -> Self {
        Optimistic {
            cache,
            backend,
            safety_delay: config.safety_refetch_delay,
        }
    }

    /// Insert a row carrying a client-side id. The server may assign another
    /// id, in which case the provisional row is swapped for the saved one.
    pub async fn create(&self, values: Record) -> Result<Record> {
        let id = values
            .id()
            .ok_or_else(|| Error::InvalidRecord("optimistic create needs an id".to_string()))?;
        let previous = self
            .cache
            .apply_optimistic(&OptimisticChange::Upsert(values.clone()));

        match self.backend.create(self.cache.entity(), values.clone()).await {
            Ok(saved) => {
                self.confirm_upsert(&id, &values, saved.clone());
                Ok(saved)
            }
            Err(e) => {
                log::warn!("Create on {} failed, rolling back: {}", self.cache.entity(), e);
                self.rollback(&id, Some(&values), previous);
                Err(e)
            }
        }
    }

    /// Patch an existing row with `values`.
    pub async fn update(&self, id: &str, values: Record) -> Result<Record> {
        let optimistic = match self.cache.get(id) {
            Some(current) => current.merged(&values),
            None => values.merged(&crate::record! { "id" => id }),
        };
        let previous = self
            .cache
            .apply_optimistic(&OptimisticChange::Upsert(optimistic.clone()));

        match self.backend.update(self.cache.entity(), id, values).await {
            Ok(saved) => {
                self.confirm_upsert(id, &optimistic, saved.clone());
                Ok(saved)
            }
            Err(e) => {
                log::warn!("Update of {} {} failed, rolling back: {}", self.cache.entity(), id, e);
                self.rollback(id, Some(&optimistic), previous);
                Err(e)
            }
        }
    }

    /// Remove a row. Returns false (after restoring it) when the backend
    /// reports nothing was deleted.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let previous = self
            .cache
            .apply_optimistic(&OptimisticChange::Remove(id.to_string()));

        match self.backend.delete(self.cache.entity(), id).await {
            Ok(true) => {
                self.cache.confirm_optimistic(id, None, None);
                self.schedule_check(id.to_string(), false);
                Ok(true)
            }
            Ok(false) => {
                self.rollback(id, None, previous);
                Ok(false)
            }
            Err(e) => {
                log::warn!("Delete of {} {} failed, rolling back: {}", self.cache.entity(), id, e);
                self.rollback(id, None, previous);
                Err(e)
            }
        }
    }

    fn confirm_upsert(&self, id: &str, optimistic: &Record, saved: Record) {
        let saved_id = saved.id().unwrap_or_else(|| id.to_string());
        if saved_id != id {
            self.cache.confirm_optimistic(id, Some(optimistic), None);
            self.cache.confirm_optimistic(&saved_id, None, Some(saved));
        } else if !self.cache.confirm_optimistic(id, Some(optimistic), Some(saved)) {
            log::debug!("{} {} already updated by the feed", self.cache.entity(), id);
        }
        self.schedule_check(saved_id, true);
    }

    fn rollback(&self, id: &str, optimistic: Option<&Record>, previous: Option<Record>) {
        if !self.cache.rollback_optimistic(id, optimistic, previous) {
            log::debug!(
                "Skipping rollback of {} {}, row changed since the local edit",
                self.cache.entity(),
                id
            );
        }
    }

    /// After the safety delay, refetch when the cache still does not show the
    /// confirmed outcome (row present for upserts, absent for deletes).
    fn schedule_check(&self, id: String, expect_present: bool) {
        let cache = Arc::downgrade(&self.cache);
        let delay = self.safety_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(cache) = cache.upgrade() else {
                return;
            };
            if cache.get(&id).is_some() != expect_present {
                log::info!("{} {} not reconciled after {:?}, refetching", cache.entity(), id, delay);
                cache.refetch().await;
            }
        });
    }
}
