use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::{AHashMap, AHashSet};
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::record;
use crate::*;

/// Backend double holding tables in memory, with switches for failures and
/// gates that keep snapshots or mutations in flight until released.
#[derive(Default)]
pub struct MockBackend {
    tables: Mutex<AHashMap<EntityName, Vec<Record>>>,
    failing_snapshots: Mutex<AHashSet<EntityName>>,
    failing_deletes: Mutex<AHashSet<String>>,
    fail_mutations: AtomicBool,
    fail_viewed: AtomicBool,
    bulk_entities: Mutex<AHashSet<EntityName>>,
    created_id: Mutex<Option<String>>,
    snapshot_gate: Mutex<Option<Arc<Semaphore>>>,
    mutation_gate: Mutex<Option<Arc<Semaphore>>>,
    snapshots: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_table(&self, entity: EntityName, rows: Vec<Record>) {
        lock(&self.tables).insert(entity, rows);
    }

    pub fn table_ids(&self, entity: EntityName) -> Vec<String> {
        lock(&self.tables)
            .get(&entity)
            .map(|rows| rows.iter().filter_map(Record::id).collect())
            .unwrap_or_default()
    }

    pub fn fail_snapshots(&self, entity: EntityName, fail: bool) {
        let mut failing = lock(&self.failing_snapshots);
        if fail {
            failing.insert(entity);
        } else {
            failing.remove(&entity);
        }
    }

    pub fn fail_delete_of(&self, id: &str) {
        lock(&self.failing_deletes).insert(id.to_string());
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_viewed(&self, fail: bool) {
        self.fail_viewed.store(fail, Ordering::SeqCst);
    }

    pub fn enable_bulk_delete(&self, entity: EntityName) {
        lock(&self.bulk_entities).insert(entity);
    }

    /// Make the next creates come back with a server-assigned id
    pub fn assign_created_id(&self, id: &str) {
        *lock(&self.created_id) = Some(id.to_string());
    }

    /// Snapshots read their rows, then wait for `release_snapshots`
    pub fn hold_snapshots(&self) {
        *lock(&self.snapshot_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_snapshots(&self, count: usize) {
        if let Some(gate) = lock(&self.snapshot_gate).as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn hold_mutations(&self) {
        *lock(&self.mutation_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_mutations(&self, count: usize) {
        if let Some(gate) = lock(&self.mutation_gate).as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record_call(&self, call: String) {
        lock(&self.calls).push(call);
    }

    async fn pass_gate(gate: Option<Arc<Semaphore>>) {
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn remove_row(&self, entity: EntityName, id: &str) -> bool {
        let mut tables = lock(&self.tables);
        let rows = tables.entry(entity).or_default();
        let before = rows.len();
        rows.retain(|row| row.id().as_deref() != Some(id));
        rows.len() != before
    }

    fn upsert_row(&self, entity: EntityName, record: Record) {
        let mut tables = lock(&self.tables);
        let rows = tables.entry(entity).or_default();
        rows.retain(|row| row.id() != record.id());
        rows.push(record);
    }
}

impl SnapshotSource for MockBackend {
    fn fetch_snapshot<'a>(
        &'a self,
        entity: EntityName,
        _join: &'a JoinShape,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        Box::pin(async move {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            let failing = lock(&self.failing_snapshots).contains(&entity);
            let rows = lock(&self.tables).get(&entity).cloned().unwrap_or_default();
            let gate = lock(&self.snapshot_gate).clone();
            Self::pass_gate(gate).await;

            if failing {
                Err(Error::Snapshot {
                    entity,
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(rows)
            }
        })
    }
}

impl MutationBackend for MockBackend {
    fn create<'a>(&'a self, entity: EntityName, values: Record) -> BoxFuture<'a, Result<Record>> {
        Box::pin(async move {
            let gate = lock(&self.mutation_gate).clone();
            Self::pass_gate(gate).await;
            self.record_call(format!("create {}", entity));
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(Error::Transport("create refused".to_string()));
            }
            let saved = match lock(&self.created_id).take() {
                Some(id) => values.merged(&record! { "id" => id }),
                None => values,
            };
            self.upsert_row(entity, saved.clone());
            Ok(saved)
        })
    }

    fn update<'a>(
        &'a self,
        entity: EntityName,
        id: &'a str,
        values: Record,
    ) -> BoxFuture<'a, Result<Record>> {
        Box::pin(async move {
            let gate = lock(&self.mutation_gate).clone();
            Self::pass_gate(gate).await;
            self.record_call(format!("update {} {}", entity, id));
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(Error::Transport("update refused".to_string()));
            }
            let current = lock(&self.tables)
                .get(&entity)
                .and_then(|rows| rows.iter().find(|row| row.id().as_deref() == Some(id)).cloned())
                .unwrap_or_else(|| record! { "id" => id });
            let saved = current
                .merged(&values)
                .merged(&record! { "updated_at" => "2024-05-01T12:00:00Z" });
            self.upsert_row(entity, saved.clone());
            Ok(saved)
        })
    }

    fn delete<'a>(&'a self, entity: EntityName, id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let gate = lock(&self.mutation_gate).clone();
            Self::pass_gate(gate).await;
            self.record_call(format!("delete {} {}", entity, id));
            if self.fail_mutations.load(Ordering::SeqCst) || lock(&self.failing_deletes).contains(id) {
                return Err(Error::Transport(format!("delete of {} refused", id)));
            }
            Ok(self.remove_row(entity, id))
        })
    }

    fn supports_bulk_delete(&self, entity: EntityName) -> bool {
        lock(&self.bulk_entities).contains(&entity)
    }

    fn bulk_delete<'a>(
        &'a self,
        entity: EntityName,
        ids: &'a [String],
    ) -> BoxFuture<'a, Result<BulkDeleteOutcome>> {
        Box::pin(async move {
            self.record_call(format!("bulk_delete {} {}", entity, ids.join(",")));
            let mut outcome = BulkDeleteOutcome::default();
            for id in ids {
                if lock(&self.failing_deletes).contains(id) || !self.remove_row(entity, id) {
                    outcome.failed_ids.push(id.clone());
                } else {
                    outcome.success_ids.push(id.clone());
                }
            }
            Ok(outcome)
        })
    }

    fn mark_viewed<'a>(&'a self, entity: EntityName, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record_call(format!("viewed {} {}", entity, id));
            if self.fail_viewed.load(Ordering::SeqCst) {
                Err(Error::Transport("offline".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

/// Source wrapper counting how often the feed loads it
pub struct CountingSource {
    pub inner: Arc<EntityCache>,
    pub loads: AtomicUsize,
}

impl CountingSource {
    pub fn new(inner: Arc<EntityCache>) -> Arc<Self> {
        Arc::new(CountingSource {
            inner,
            loads: AtomicUsize::new(0),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl NotificationSource for CountingSource {
    fn kind(&self) -> NotificationKind {
        self.inner.kind()
    }

    fn load(&self, force: bool) -> BoxFuture<'_, Result<Vec<Record>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(force)
    }
}

/// Storage whose writes always fail, as with a full or disabled store
pub struct FailingStorage;

impl KeyValueStorage for FailingStorage {
    fn get(&self, _key: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    fn set(&self, key: &str, _value: serde_json::Value) -> Result<()> {
        Err(Error::Storage(format!("quota exceeded writing {}", key)))
    }
}

/// Feed, bus and backend wired together
pub struct Harness {
    pub feed: Arc<MemoryChangeFeed>,
    pub bus: Arc<EventBus>,
    pub backend: Arc<MockBackend>,
    pub config: SyncConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let feed = Arc::new(MemoryChangeFeed::new());
        let bus = Arc::new(EventBus::new(feed.clone(), &config));
        Harness {
            feed,
            bus,
            backend: MockBackend::new(),
            config,
        }
    }

    pub async fn cache(&self, spec: CacheSpec) -> Arc<EntityCache> {
        EntityCache::mount(&self.bus, self.backend.clone(), spec, &self.config)
            .await
            .expect("cache mounts")
    }
}

/// Let pump tasks and spawned work run to completion
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Ids and a column of a derived list, for compact assertions
pub fn column(records: &[Record], field: &str) -> Vec<(String, serde_json::Value)> {
    records
        .iter()
        .map(|r| {
            (
                r.id().unwrap_or_default(),
                r.get(field).cloned().unwrap_or(serde_json::Value::Null),
            )
        })
        .collect()
}
