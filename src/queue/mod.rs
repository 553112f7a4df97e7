use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::cache::LocalCache;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityHandle;
use crate::logging::LogScope;
use crate::model::{CachedCollection, CachedRecord, Collection, OwnerId, RecordPatch};
use crate::remote::RemoteStore;
use crate::time::Clock;
use crate::AppResult;

mod item;
mod processor;
mod store;

pub use item::{Operation, QueueItem, QueueStatus, SyncOutcome, SyncReport};
pub use processor::QueueProcessor;
pub use store::MutationQueue;

/// Components holding owner- or record-keyed data outside the cache and queue.
#[async_trait]
pub trait NamespaceListener: Send + Sync {
    async fn on_owner_migrated(&self, from: &OwnerId, to: &OwnerId) -> AppResult<()>;

    async fn on_record_id_remapped(
        &self,
        owner: &OwnerId,
        collection: Collection,
        from: &str,
        to: &str,
    ) -> AppResult<()>;
}

pub(crate) type Listeners = Arc<RwLock<Vec<Arc<dyn NamespaceListener>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub records: usize,
    pub queue_items: usize,
}

/// Undo for an optimistic cache update: the record as it was before.
#[derive(Debug, Clone)]
#[must_use = "dropping a compensation means the update can no longer be rolled back"]
pub struct Compensation {
    collection: Collection,
    owner: OwnerId,
    previous: CachedRecord,
    queue_id: Option<String>,
}

impl Compensation {
    pub fn previous(&self) -> &CachedRecord {
        &self.previous
    }

    pub fn queue_id(&self) -> Option<&str> {
        self.queue_id.as_deref()
    }
}

/// Cache + queue facade handed to callers. Clones share all state.
#[derive(Clone)]
pub struct SyncService {
    cache: LocalCache,
    queue: MutationQueue,
    processor: QueueProcessor,
    listeners: Listeners,
    clock: Arc<dyn Clock>,
}

impl SyncService {
    pub fn new(
        cache: LocalCache,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityHandle,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = MutationQueue::new(cache.store().clone());
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let processor = QueueProcessor::new(
            queue.clone(),
            cache.clone(),
            remote,
            connectivity,
            config,
            listeners.clone(),
        );
        Self {
            cache,
            queue,
            processor,
            listeners,
            clock,
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Loads the queue and returns how many crashed in-flight items were reset.
    pub async fn initialize(&self) -> AppResult<usize> {
        self.queue.recover().await
    }

    pub fn add_listener(&self, listener: Arc<dyn NamespaceListener>) {
        if let Ok(mut guard) = self.listeners.write() {
            guard.push(listener);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn NamespaceListener>> {
        self.listeners.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub async fn enqueue(
        &self,
        operation: Operation,
        collection: Collection,
        item_id: &str,
        owner: &OwnerId,
        payload: Map<String, Value>,
    ) -> Option<String> {
        self.queue
            .enqueue(operation, collection, item_id, owner, payload)
            .await
    }

    pub async fn get_pending_count(&self, owner: Option<&OwnerId>) -> usize {
        self.queue.pending_count(owner).await
    }

    pub async fn get_from_cache(
        &self,
        collection: Collection,
        owner: &OwnerId,
    ) -> AppResult<Option<CachedCollection>> {
        self.cache.get(collection, owner).await
    }

    pub async fn get_item_from_cache(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
    ) -> AppResult<Option<CachedRecord>> {
        self.cache.get_item(collection, owner, id).await
    }

    pub async fn save_to_cache(
        &self,
        collection: Collection,
        owner: &OwnerId,
        records: Vec<CachedRecord>,
    ) -> AppResult<()> {
        self.cache.save(collection, owner, records).await
    }

    pub async fn update_item_in_cache(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
        patch: &RecordPatch,
    ) -> AppResult<Option<CachedRecord>> {
        self.cache.update_item(collection, owner, id, patch).await
    }

    pub async fn remove_item_from_cache(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
    ) -> AppResult<Option<CachedRecord>> {
        self.cache.remove_item(collection, owner, id).await
    }

    /// Cache write, then UPDATE enqueue. `None` when the record is not cached
    /// (nothing is queued in that case).
    pub async fn apply_update(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
        patch: RecordPatch,
    ) -> AppResult<Option<Compensation>> {
        let patch = if patch.get("updatedAt").is_none() {
            patch.set("updatedAt", self.clock.now_ms())
        } else {
            patch
        };
        let Some(previous) = self.cache.update_item(collection, owner, id, &patch).await? else {
            return Ok(None);
        };
        let queue_id = self
            .queue
            .enqueue(Operation::Update, collection, id, owner, patch.into_map())
            .await;
        Ok(Some(Compensation {
            collection,
            owner: owner.clone(),
            previous,
            queue_id,
        }))
    }

    /// Restores the pre-update record and withdraws its queued write if it
    /// has not been replayed yet.
    pub async fn compensate(&self, compensation: Compensation) -> AppResult<()> {
        let Compensation {
            collection,
            owner,
            previous,
            queue_id,
        } = compensation;
        let id = previous.id.clone();
        self.cache.put_item(collection, &owner, previous).await?;
        if let Some(queue_id) = queue_id {
            self.queue.remove(&queue_id).await?;
        }
        info!(
            target: "dosekeeper",
            event = "update_compensated",
            collection = collection.as_str(),
            owner = %owner,
            id = %id
        );
        Ok(())
    }

    /// Re-keys every cached collection and queued item of `from` to `to` in
    /// one atomic storage batch, then lets listeners follow.
    pub async fn migrate_user_namespace(&self, from: &OwnerId, to: &OwnerId) -> AppResult<MigrationReport> {
        if from == to {
            return Ok(MigrationReport {
                records: 0,
                queue_items: 0,
            });
        }
        let scope = LogScope::new("migrate_user_namespace", Some(to.as_str()));
        let report = {
            let _cache = self.cache.lock_exclusive().await;
            let (ops, records) = match self.cache.namespace_ops(from, to).await {
                Ok(found) => found,
                Err(err) => {
                    scope.fail(&err);
                    return Err(err);
                }
            };
            let queue_items = match self.queue.migrate_owner_with(from, to, ops).await {
                Ok(moved) => moved,
                Err(err) => {
                    scope.fail(&err);
                    return Err(err);
                }
            };
            MigrationReport {
                records,
                queue_items,
            }
        };

        for listener in self.listeners() {
            if let Err(err) = listener.on_owner_migrated(from, to).await {
                warn!(
                    target: "dosekeeper",
                    event = "migration_listener_failed",
                    error = %err
                );
            }
        }

        scope.success(json!({
            "from": from.as_str(),
            "records": report.records,
            "queue_items": report.queue_items,
        }));
        Ok(report)
    }

    pub async fn process_queue(&self) -> AppResult<SyncReport> {
        self.processor.process_queue().await
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }

    pub async fn clear_all(&self) -> AppResult<usize> {
        self.cache.clear_all().await
    }
}
