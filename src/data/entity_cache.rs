use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use crate::data::{
    ChangeAction, ChangeEvent, EntityName, EventBus, JoinShape, Record, Relation, SnapshotSource,
    Subscription,
};
use crate::{lock, Result, SyncConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Column the derived list is ordered by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn ascending(field: &str) -> Self {
        SortKey {
            field: field.to_string(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(field: &str) -> Self {
        SortKey {
            field: field.to_string(),
            order: SortOrder::Descending,
        }
    }

    /// Rows missing the column sort last in either direction. Ties are broken
    /// by id so the derived list is stable across rebuilds.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ordering = match (a.sort_value(&self.field), b.sort_value(&self.field)) {
            (Some(x), Some(y)) => match self.order {
                SortOrder::Ascending => x.compare(&y),
                SortOrder::Descending => x.compare(&y).reverse(),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        ordering.then_with(|| a.id().cmp(&b.id()))
    }
}

/// Parameters of one entity cache: which collection, how the derived list is
/// ordered and which joined tables the snapshot embeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub entity: EntityName,
    pub sort: SortKey,
    pub join: JoinShape,
}

impl CacheSpec {
    pub fn new(entity: EntityName, sort: SortKey, join: JoinShape) -> Self {
        CacheSpec { entity, sort, join }
    }

    /// Activity feed of recados, newest first, with the author embedded
    pub fn recados() -> Self {
        CacheSpec::new(
            EntityName::Recados,
            SortKey::descending("created_at"),
            JoinShape::plain().with(Relation::new("autor", "profiles", &["id", "nome"])),
        )
    }

    pub fn materiais() -> Self {
        CacheSpec::new(
            EntityName::Materiais,
            SortKey::descending("created_at"),
            JoinShape::plain().with(Relation::new("disciplina", "disciplinas", &["id", "nome"])),
        )
    }

    /// Due-date feed, closest deadline first
    pub fn provas_tarefas() -> Self {
        CacheSpec::new(
            EntityName::ProvasTarefas,
            SortKey::ascending("data_entrega"),
            JoinShape::plain().with(Relation::new("disciplina", "disciplinas", &["id", "nome"])),
        )
    }

    pub fn notas() -> Self {
        CacheSpec::new(
            EntityName::Notas,
            SortKey::descending("created_at"),
            JoinShape::plain()
                .with(Relation::new("disciplina", "disciplinas", &["id", "nome"]))
                .with(Relation::new("avaliacao", "provas_tarefas", &["id", "titulo", "tipo"])),
        )
    }

    pub fn for_entity(entity: EntityName) -> Self {
        match entity {
            EntityName::Recados => Self::recados(),
            EntityName::Materiais => Self::materiais(),
            EntityName::ProvasTarefas => Self::provas_tarefas(),
            EntityName::Notas => Self::notas(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    /// Nothing fetched yet
    Cold,
    /// Snapshot in flight, events are buffered
    Fetching,
    /// Snapshot applied, events are applied as they arrive
    Live,
}

/// Called with the entity and the new revision after every mutation
pub type ChangeListener = Arc<dyn Fn(EntityName, u64) + Send + Sync>;

#[derive(Debug)]
struct PendingEvent {
    event: ChangeEvent,
    // Local change still waiting for the backend's answer
    optimistic: bool,
}

#[derive(Debug)]
struct CacheState {
    phase: CachePhase,
    records: AHashMap<String, Record>,
    sorted: Vec<Record>,
    pending: Vec<PendingEvent>,
    loading: bool,
    error: Option<String>,
    // Bumped by every snapshot request; responses from older requests are dropped
    generation: u64,
    revision: u64,
}

/// In-memory view of one entity collection kept in sync with the change feed.
pub struct EntityCache {
    spec: CacheSpec,
    source: Arc<dyn SnapshotSource>,
    state: Mutex<CacheState>,
    listeners: Mutex<Vec<ChangeListener>>,
    subscriptions: Mutex<Vec<Subscription>>,
    live: Notify,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("EntityCache")
            .field("entity", &self.spec.entity)
            .field("phase", &state.phase)
            .field("records", &state.records.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl EntityCache {
    /// Create a cold cache that is not attached to any bus.
    pub fn new(spec: CacheSpec, source: Arc<dyn SnapshotSource>) -> Self {
        EntityCache {
            spec,
            source,
            state: Mutex::new(CacheState {
                phase: CachePhase::Cold,
                records: AHashMap::new(),
                sorted: Vec::new(),
                pending: Vec::new(),
                loading: false,
                error: None,
                generation: 0,
                revision: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            live: Notify::new(),
        }
    }

    /// Attach a cache to the bus and load its first snapshot.
    ///
    /// Subscriptions are registered before the snapshot request so that no
    /// event emitted while the query runs is lost.
    pub async fn mount(
        bus: &Arc<EventBus>,
        source: Arc<dyn SnapshotSource>,
        spec: CacheSpec,
        config: &SyncConfig,
    ) -> Result<Arc<Self>> {
        bus.initialize()?;

        let entity = spec.entity;
        let cache = Arc::new(EntityCache::new(spec, source));

        let weak = Arc::downgrade(&cache);
        let events = bus.subscribe(entity, move |event| {
            if let Some(cache) = weak.upgrade() {
                cache.handle_event(event);
            }
        });

        let weak = Arc::downgrade(&cache);
        let deletions = bus.on_broadcast(&config.deletion_broadcast, move |payload| {
            let Some(cache) = weak.upgrade() else {
                return;
            };
            if let Some(event) = deletion_notice(entity, payload) {
                cache.handle_event(&event);
            }
        });

        lock(&cache.subscriptions).extend([events, deletions]);

        cache.refetch().await;
        Ok(cache)
    }

    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }

    pub fn entity(&self) -> EntityName {
        self.spec.entity
    }

    /// Route a change event: buffered until the snapshot lands, applied after.
    pub fn handle_event(&self, event: &ChangeEvent) {
        if event.entity != self.spec.entity {
            return;
        }

        let mut state = lock(&self.state);
        if state.phase != CachePhase::Live {
            log::debug!(
                "Buffering {:?} on {} until snapshot completes",
                event.action,
                self.spec.entity
            );
            state.pending.push(PendingEvent {
                event: event.clone(),
                optimistic: false,
            });
            return;
        }

        if apply_event(&mut state.records, event) {
            self.commit(state);
        }
    }

    /// Replace the cache with a fresh snapshot, then replay buffered events.
    ///
    /// Returns true when a snapshot was applied. On failure the error is
    /// retained, the previous records are kept and buffered events are
    /// applied on top of them.
    pub async fn refetch(&self) -> bool {
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.phase = CachePhase::Fetching;
            state.loading = true;
            state.generation
        };

        let result = self
            .source
            .fetch_snapshot(self.spec.entity, &self.spec.join)
            .await;

        let mut state = lock(&self.state);
        if generation != state.generation {
            log::debug!(
                "Dropping stale {} snapshot (request {}, latest {})",
                self.spec.entity,
                generation,
                state.generation
            );
            return false;
        }

        let applied = match result {
            Ok(rows) => {
                let mut records = AHashMap::with_capacity(rows.len());
                for row in rows {
                    match row.id() {
                        Some(id) => {
                            records.insert(id, row);
                        }
                        None => log::warn!("Skipping {} row without id", self.spec.entity),
                    }
                }
                state.records = records;
                state.error = None;
                true
            }
            Err(e) => {
                log::error!("Snapshot of {} failed: {}", self.spec.entity, e);
                state.error = Some(e.to_string());
                false
            }
        };

        let pending = std::mem::take(&mut state.pending);
        for entry in &pending {
            apply_event(&mut state.records, &entry.event);
        }
        state.phase = CachePhase::Live;
        state.loading = false;

        log::debug!(
            "{} live with {} records ({} buffered events replayed)",
            self.spec.entity,
            state.records.len(),
            pending.len()
        );
        self.commit(state);
        self.live.notify_waiters();
        applied
    }

    /// Wait for the snapshot in flight, if any, to be applied.
    pub async fn wait_until_live(&self) {
        loop {
            let notified = self.live.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.phase() != CachePhase::Fetching {
                return;
            }
            notified.await;
        }
    }

    /// Apply a local change ahead of the backend. Returns the row it replaced.
    ///
    /// While a snapshot is in flight the change is also queued so the
    /// snapshot does not wipe it out. The queued copy is settled by
    /// [`confirm_optimistic`](Self::confirm_optimistic) or
    /// [`rollback_optimistic`](Self::rollback_optimistic).
    pub fn apply_optimistic(&self, change: &crate::data::OptimisticChange) -> Option<Record> {
        let event = change.to_event(self.spec.entity);
        let mut state = lock(&self.state);
        let id = event.record_id()?;
        let previous = state.records.get(&id).cloned();

        if state.phase != CachePhase::Live {
            state.pending.push(PendingEvent {
                event: event.clone(),
                optimistic: true,
            });
        }
        if apply_event(&mut state.records, &event) {
            self.commit(state);
        }
        previous
    }

    /// Swap the row under `id` only if it still equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    pub fn compare_and_set(
        &self,
        id: &str,
        expected: Option<&Record>,
        replacement: Option<Record>,
    ) -> bool {
        let state = lock(&self.state);
        self.swap(state, id, expected, replacement)
    }

    /// Settle a local change the backend accepted: `confirmed` is the saved
    /// row, or `None` when the row is gone. The row is swapped in only if it
    /// still holds `optimistic`. While a snapshot is in flight the queued
    /// local change is rewritten to the confirmed state so the replay after
    /// the snapshot installs the server's row.
    pub fn confirm_optimistic(
        &self,
        id: &str,
        optimistic: Option<&Record>,
        confirmed: Option<Record>,
    ) -> bool {
        let mut state = lock(&self.state);
        if state.phase != CachePhase::Live {
            let event = match &confirmed {
                Some(record) => ChangeEvent::update(self.spec.entity, record.clone()),
                None => ChangeEvent::delete(self.spec.entity, crate::record! { "id" => id }),
            };
            let entry = PendingEvent {
                event,
                optimistic: false,
            };
            match queued_optimistic(&state.pending, id, optimistic) {
                Some(index) => state.pending[index] = entry,
                None => state.pending.push(entry),
            }
        }
        self.swap(state, id, optimistic, confirmed)
    }

    /// Undo a local change the backend refused, restoring `previous` if the
    /// row still holds `optimistic`. A queued copy of the change is dropped
    /// so the snapshot in flight stays authoritative.
    pub fn rollback_optimistic(
        &self,
        id: &str,
        optimistic: Option<&Record>,
        previous: Option<Record>,
    ) -> bool {
        let mut state = lock(&self.state);
        if let Some(index) = queued_optimistic(&state.pending, id, optimistic) {
            state.pending.remove(index);
        }
        self.swap(state, id, optimistic, previous)
    }

    fn swap(
        &self,
        mut state: std::sync::MutexGuard<'_, CacheState>,
        id: &str,
        expected: Option<&Record>,
        replacement: Option<Record>,
    ) -> bool {
        if state.records.get(id) != expected {
            return false;
        }

        let changed = match replacement {
            Some(record) => state.records.insert(id.to_string(), record.clone()) != Some(record),
            None => state.records.remove(id).is_some(),
        };
        if changed {
            self.commit(state);
        }
        true
    }

    /// Derived list ordered by the cache's sort key
    pub fn records(&self) -> Vec<Record> {
        lock(&self.state).sorted.clone()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        lock(&self.state).records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self) -> CachePhase {
        lock(&self.state).phase
    }

    pub fn is_live(&self) -> bool {
        self.phase() == CachePhase::Live
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    /// Last snapshot error, cleared by the next successful snapshot
    pub fn error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Incremented after every change to the records
    pub fn revision(&self) -> u64 {
        lock(&self.state).revision
    }

    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(EntityName, u64) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    fn commit(&self, mut state: std::sync::MutexGuard<'_, CacheState>) {
        let mut sorted: Vec<Record> = state.records.values().cloned().collect();
        sorted.sort_by(|a, b| self.spec.sort.compare(a, b));
        state.sorted = sorted;
        state.revision += 1;
        let revision = state.revision;
        drop(state);

        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(self.spec.entity, revision);
        }
    }
}

/// Apply one event to a record map. Returns true when the map changed.
///
/// INSERT and UPDATE are both upserts, DELETE of an unknown id is a no-op, so
/// applying the same event twice is harmless.
pub(crate) fn apply_event(records: &mut AHashMap<String, Record>, event: &ChangeEvent) -> bool {
    let Some(id) = event.record_id() else {
        log::warn!("Ignoring {:?} on {} without a record id", event.action, event.entity);
        return false;
    };

    match event.action {
        ChangeAction::Insert | ChangeAction::Update => match &event.new_record {
            Some(record) => records.insert(id, record.clone()).as_ref() != Some(record),
            None => false,
        },
        ChangeAction::Delete => records.remove(&id).is_some(),
    }
}

/// Latest queued local change on `id` whose resulting row is `optimistic`
/// (`None` for a removal).
fn queued_optimistic(pending: &[PendingEvent], id: &str, optimistic: Option<&Record>) -> Option<usize> {
    pending.iter().rposition(|entry| {
        entry.optimistic
            && entry.event.record_id().as_deref() == Some(id)
            && entry.event.new_record.as_ref() == optimistic
    })
}

/// Turn a deletion broadcast `{ "entity": "...", "id": "..." }` into a DELETE
/// event when it targets `entity`.
fn deletion_notice(entity: EntityName, payload: &JsonValue) -> Option<ChangeEvent> {
    let target = payload.get("entity")?.as_str()?;
    if target != entity.table() {
        return None;
    }
    let id = match payload.get("id")? {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(ChangeEvent::delete(entity, crate::record! { "id" => id }))
}
