use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashSet;
use futures_util::future::{join_all, BoxFuture};
use itertools::Itertools;
use serde_json::json;

use crate::data::{BulkDeleteOutcome, CachePhase, EntityCache, EventBus, MutationBackend, Record, Subscription};
use crate::notify::{Debouncer, NotificationId, NotificationItem, NotificationKind, ReadSet};
use crate::{lock, Error, Result, SyncConfig};

/// A producer of rows for the notification feed.
pub trait NotificationSource: Send + Sync {
    fn kind(&self) -> NotificationKind;

    /// Current rows. With `force` the source reloads from the backend first.
    fn load(&self, force: bool) -> BoxFuture<'_, Result<Vec<Record>>>;
}

impl NotificationSource for EntityCache {
    fn kind(&self) -> NotificationKind {
        NotificationKind::from_entity(self.entity())
    }

    fn load(&self, force: bool) -> BoxFuture<'_, Result<Vec<Record>>> {
        Box::pin(async move {
            // A snapshot already in flight is awaited rather than superseded
            if force || self.phase() == CachePhase::Cold {
                self.refetch().await;
            } else {
                self.wait_until_live().await;
            }
            match self.error() {
                Some(message) if self.is_empty() => Err(Error::Snapshot {
                    entity: self.entity(),
                    message,
                }),
                _ => Ok(self.records()),
            }
        })
    }
}

#[derive(Debug, Default)]
struct FeedState {
    items: Vec<NotificationItem>,
    loading: bool,
    error: Option<String>,
    // Refresh tickets; a refresh older than the last applied one is dropped
    requested: u64,
    applied: u64,
}

/// Unified notification feed over several entity caches.
///
/// Items are derived on every refresh and carry a read flag overlaid from the
/// persisted [`ReadSet`]. Feed events on any watched entity schedule a
/// debounced refresh.
pub struct NotificationCenter {
    bus: Arc<EventBus>,
    sources: Vec<Arc<dyn NotificationSource>>,
    backend: Arc<dyn MutationBackend>,
    deletion_broadcast: String,
    state: Mutex<FeedState>,
    read_set: Mutex<ReadSet>,
    online: AtomicBool,
    debouncer: Debouncer,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = lock(&self.state).items.len();
        let user = self.user();
        f.debug_struct("NotificationCenter")
            .field("sources", &self.sources.len())
            .field("items", &items)
            .field("user", &user)
            .finish()
    }
}

impl NotificationCenter {
    /// Build the center and watch the sources' entities on the bus.
    /// The feed stays empty until the first `refresh`.
    pub fn new(
        bus: Arc<EventBus>,
        sources: Vec<Arc<dyn NotificationSource>>,
        backend: Arc<dyn MutationBackend>,
        read_set: ReadSet,
        config: &SyncConfig,
    ) -> Result<Arc<Self>> {
        bus.initialize()?;

        let center = Arc::new(NotificationCenter {
            bus: Arc::clone(&bus),
            sources,
            backend,
            deletion_broadcast: config.deletion_broadcast.clone(),
            state: Mutex::new(FeedState::default()),
            read_set: Mutex::new(read_set),
            online: AtomicBool::new(true),
            debouncer: Debouncer::new(config.debounce),
            subscriptions: Mutex::new(Vec::new()),
        });

        let watched: Vec<_> = center
            .sources
            .iter()
            .map(|source| source.kind().entity())
            .unique()
            .collect();

        let subscriptions: Vec<Subscription> = watched
            .into_iter()
            .map(|entity| {
                let weak = Arc::downgrade(&center);
                bus.subscribe(entity, move |_event| {
                    if let Some(center) = weak.upgrade() {
                        center.schedule_refresh();
                    }
                })
            })
            .collect();
        *lock(&center.subscriptions) = subscriptions;

        Ok(center)
    }

    /// Restart the debounce timer; the refresh runs once the feed is quiet.
    pub fn schedule_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.debouncer.schedule(move || async move {
            if let Some(center) = weak.upgrade() {
                center.refresh().await;
            }
        });
    }

    /// Rebuild the feed from what the sources currently hold.
    /// Returns false when at least one source failed; the rest are kept.
    pub async fn refresh(&self) -> bool {
        self.rebuild(false).await
    }

    /// Like `refresh`, but every source reloads its snapshot first.
    pub async fn reload(&self) -> bool {
        self.rebuild(true).await
    }

    async fn rebuild(&self, force: bool) -> bool {
        let ticket = {
            let mut state = lock(&self.state);
            state.requested += 1;
            state.loading = true;
            state.requested
        };

        let results = join_all(self.sources.iter().map(|source| source.load(force))).await;

        let mut items = Vec::new();
        let mut seen = AHashSet::new();
        let mut failures = Vec::new();
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(records) => {
                    for record in records {
                        let Some(item) = NotificationItem::from_record(source.kind(), record) else {
                            continue;
                        };
                        if seen.insert(item.key()) {
                            items.push(item);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Notification source {:?} failed: {}", source.kind(), e);
                    failures.push(e.to_string());
                }
            }
        }

        {
            let read_set = lock(&self.read_set);
            for item in items.iter_mut() {
                item.read = read_set.contains(&item.key());
            }
        }
        items.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.key().cmp(&b.key()))
        });

        let mut state = lock(&self.state);
        if ticket < state.applied {
            log::debug!("Dropping notification refresh {} superseded by {}", ticket, state.applied);
            return false;
        }
        state.applied = ticket;
        state.items = items;
        state.loading = ticket < state.requested;
        state.error = if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        };
        failures.is_empty()
    }

    pub fn items(&self) -> Vec<NotificationItem> {
        lock(&self.state).items.clone()
    }

    pub fn get(&self, id: &str) -> Option<NotificationItem> {
        lock(&self.state)
            .items
            .iter()
            .find(|item| item.key() == id)
            .cloned()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.state).items.iter().filter(|item| !item.read).count()
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    /// Errors of the sources that failed during the last refresh
    pub fn error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_refresh_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Switch read state to another user (or none) and re-flag loaded items.
    pub fn set_user(&self, user: Option<&str>) {
        let mut read_set = lock(&self.read_set);
        if !read_set.switch_user(user) {
            return;
        }
        let mut state = lock(&self.state);
        for item in state.items.iter_mut() {
            item.read = read_set.contains(&item.key());
        }
    }

    pub fn user(&self) -> Option<String> {
        lock(&self.read_set).user().map(str::to_string)
    }

    pub fn mark_as_read(&self, id: &str) {
        self.set_read_flag(id, true);
        lock(&self.read_set).insert(id);

        if self.is_online() {
            if let Some(target) = self.resolve(id) {
                self.record_view(target);
            }
        }
    }

    pub fn mark_as_unread(&self, id: &str) {
        self.set_read_flag(id, false);
        lock(&self.read_set).remove(id);
    }

    pub fn mark_all_as_read(&self) {
        let keys: Vec<String> = {
            let mut state = lock(&self.state);
            state
                .items
                .iter_mut()
                .map(|item| {
                    item.read = true;
                    item.key()
                })
                .collect()
        };
        lock(&self.read_set).insert_many(keys);
    }

    /// Drop an item locally, from both the feed and the read set.
    pub fn remove_by_id(&self, id: &str) {
        lock(&self.state).items.retain(|item| item.key() != id);
        lock(&self.read_set).remove(id);
    }

    /// Delete the row behind a notification. Never fails: errors are logged
    /// and reported as `false`.
    pub async fn delete_by_id(&self, id: &str) -> bool {
        let Some(target) = self.resolve(id) else {
            log::warn!("Cannot resolve notification '{}', removing it locally", id);
            self.remove_by_id(id);
            return false;
        };

        match self
            .backend
            .delete(target.kind.entity(), &target.entity_id)
            .await
        {
            Ok(true) => {
                self.remove_by_id(id);
                self.announce_deletion(&target);
                true
            }
            Ok(false) => {
                log::warn!("Backend did not delete {}", target);
                false
            }
            Err(e) => {
                log::error!("Deleting {} failed: {}", target, e);
                false
            }
        }
    }

    /// Delete every notification currently marked read, then reload.
    pub async fn delete_read(&self) -> BulkDeleteOutcome {
        let read_ids: Vec<String> = lock(&self.state)
            .items
            .iter()
            .filter(|item| item.read)
            .map(NotificationItem::key)
            .collect();

        let results = join_all(read_ids.iter().map(|id| async move {
            (id.clone(), self.delete_by_id(id).await)
        }))
        .await;

        let mut outcome = BulkDeleteOutcome::default();
        for (id, deleted) in results {
            if deleted {
                outcome.success_ids.push(id);
            } else {
                outcome.failed_ids.push(id);
            }
        }

        self.reload().await;
        outcome
    }

    /// Delete many notifications. Kinds whose backend supports batch delete
    /// get one call, the others one call per row. Failures are isolated per
    /// id; a reload always follows.
    pub async fn bulk_delete(&self, ids: &[String]) -> BulkDeleteOutcome {
        let mut outcome = BulkDeleteOutcome::default();
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            match self.resolve(id) {
                Some(target) => resolved.push((id.clone(), target)),
                None => {
                    log::warn!("Cannot resolve notification '{}', removing it locally", id);
                    self.remove_by_id(id);
                    outcome.failed_ids.push(id.clone());
                }
            }
        }

        let groups = resolved
            .into_iter()
            .into_group_map_by(|(_, target)| target.kind);
        let results = join_all(
            groups
                .into_iter()
                .map(|(kind, entries)| self.delete_group(kind, entries)),
        )
        .await;

        for (group, deleted) in results {
            for (id, target) in deleted {
                self.remove_by_id(&id);
                self.announce_deletion(&target);
            }
            outcome.merge(group);
        }

        self.reload().await;
        outcome
    }

    /// Returns the group's outcome plus the entries that were deleted.
    async fn delete_group(
        &self,
        kind: NotificationKind,
        entries: Vec<(String, NotificationId)>,
    ) -> (BulkDeleteOutcome, Vec<(String, NotificationId)>) {
        let entity = kind.entity();
        let mut outcome = BulkDeleteOutcome::default();
        let mut deleted = Vec::new();

        if self.backend.supports_bulk_delete(entity) {
            let entity_ids: Vec<String> = entries
                .iter()
                .map(|(_, target)| target.entity_id.clone())
                .collect();
            let succeeded: AHashSet<String> = match self.backend.bulk_delete(entity, &entity_ids).await {
                Ok(result) => {
                    for failed in &result.failed_ids {
                        log::warn!("Batch delete on {} failed for {}", entity, failed);
                    }
                    result.success_ids.into_iter().collect()
                }
                Err(e) => {
                    log::error!("Batch delete on {} failed: {}", entity, e);
                    AHashSet::new()
                }
            };
            for (id, target) in entries {
                if succeeded.contains(&target.entity_id) {
                    outcome.success_ids.push(id.clone());
                    deleted.push((id, target));
                } else {
                    outcome.failed_ids.push(id);
                }
            }
        } else {
            let backend = &self.backend;
            let results = join_all(entries.into_iter().map(|(id, target)| async move {
                let result = backend.delete(entity, &target.entity_id).await;
                (id, target, result)
            }))
            .await;
            for (id, target, result) in results {
                match result {
                    Ok(true) => {
                        outcome.success_ids.push(id.clone());
                        deleted.push((id, target));
                    }
                    Ok(false) => {
                        log::warn!("Backend did not delete {}", target);
                        outcome.failed_ids.push(id);
                    }
                    Err(e) => {
                        log::error!("Deleting {} failed: {}", target, e);
                        outcome.failed_ids.push(id);
                    }
                }
            }
        }

        (outcome, deleted)
    }

    /// Stop reacting to feed events and cancel a pending refresh.
    pub fn close(&self) {
        self.debouncer.cancel();
        lock(&self.subscriptions).clear();
    }

    /// Prefer the loaded item's own id; fall back to parsing the string.
    fn resolve(&self, id: &str) -> Option<NotificationId> {
        let loaded = lock(&self.state)
            .items
            .iter()
            .find(|item| item.key() == id)
            .map(|item| item.id.clone());
        loaded.or_else(|| id.parse().ok())
    }

    fn set_read_flag(&self, id: &str, read: bool) {
        let mut state = lock(&self.state);
        if let Some(item) = state.items.iter_mut().find(|item| item.key() == id) {
            item.read = read;
        }
    }

    fn announce_deletion(&self, target: &NotificationId) {
        self.bus.publish_broadcast(
            &self.deletion_broadcast,
            json!({ "entity": target.kind.entity().table(), "id": target.entity_id }),
        );
    }

    /// Fire-and-forget "viewed" marker; failures only reach the log.
    fn record_view(&self, target: NotificationId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        runtime.spawn(async move {
            if let Err(e) = backend
                .mark_viewed(target.kind.entity(), &target.entity_id)
                .await
            {
                log::debug!("Could not record view of {}: {}", target, e);
            }
        });
    }
}
