use std::sync::Arc;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use crate::model::{CachedCollection, CachedRecord, Collection, OwnerId, RecordPatch};
use crate::storage::{json_op, keys, BatchOp, StoreHandle};
use crate::AppResult;

/// A record elsewhere in the owner's cache that pointed at a remapped id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRewrite {
    pub collection: Collection,
    pub id: String,
    pub patch: RecordPatch,
}

/// Durable per-(collection, owner) snapshots. Writers are serialized by one
/// lock so a reader never sees a half-applied write.
#[derive(Clone)]
pub struct LocalCache {
    store: StoreHandle,
    gate: Arc<RwLock<()>>,
}

impl LocalCache {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    async fn load(&self, collection: Collection, owner: &OwnerId) -> AppResult<Option<CachedCollection>> {
        self.store.get_json(&keys::cache(collection, owner)).await
    }

    async fn persist(
        &self,
        collection: Collection,
        owner: &OwnerId,
        snapshot: &CachedCollection,
    ) -> AppResult<()> {
        self.store.set_json(&keys::cache(collection, owner), snapshot).await
    }

    pub async fn get(&self, collection: Collection, owner: &OwnerId) -> AppResult<Option<CachedCollection>> {
        let _read = self.gate.read().await;
        self.load(collection, owner).await
    }

    pub async fn get_item(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
    ) -> AppResult<Option<CachedRecord>> {
        let _read = self.gate.read().await;
        Ok(self
            .load(collection, owner)
            .await?
            .and_then(|snapshot| snapshot.get(id).cloned()))
    }

    /// Full-snapshot replace. Sink for remote change subscriptions.
    pub async fn save(
        &self,
        collection: Collection,
        owner: &OwnerId,
        records: Vec<CachedRecord>,
    ) -> AppResult<()> {
        let _write = self.gate.write().await;
        let snapshot = CachedCollection::from_records(records);
        self.persist(collection, owner, &snapshot).await?;
        debug!(
            target: "dosekeeper",
            event = "cache_saved",
            collection = collection.as_str(),
            owner = %owner,
            records = snapshot.len()
        );
        Ok(())
    }

    /// Inserts or wholesale-replaces one record. Returns what it replaced.
    pub async fn put_item(
        &self,
        collection: Collection,
        owner: &OwnerId,
        record: CachedRecord,
    ) -> AppResult<Option<CachedRecord>> {
        let _write = self.gate.write().await;
        let mut snapshot = self.load(collection, owner).await?.unwrap_or_default();
        let previous = snapshot.get(&record.id).cloned();
        snapshot.upsert(record);
        self.persist(collection, owner, &snapshot).await?;
        Ok(previous)
    }

    /// Merges `patch` into an existing record. Absent records are left alone
    /// and `None` is returned; otherwise the pre-merge record is returned.
    pub async fn update_item(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
        patch: &RecordPatch,
    ) -> AppResult<Option<CachedRecord>> {
        let _write = self.gate.write().await;
        let Some(mut snapshot) = self.load(collection, owner).await? else {
            return Ok(None);
        };
        let Some(record) = snapshot.get_mut(id) else {
            return Ok(None);
        };
        let previous = record.clone();
        record.merge(patch)?;
        self.persist(collection, owner, &snapshot).await?;
        Ok(Some(previous))
    }

    pub async fn remove_item(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
    ) -> AppResult<Option<CachedRecord>> {
        let _write = self.gate.write().await;
        let Some(mut snapshot) = self.load(collection, owner).await? else {
            return Ok(None);
        };
        let removed = snapshot.remove(id);
        if removed.is_some() {
            self.persist(collection, owner, &snapshot).await?;
        }
        Ok(removed)
    }

    pub async fn list_active(&self, collection: Collection, owner: &OwnerId) -> AppResult<Vec<CachedRecord>> {
        Ok(self
            .get(collection, owner)
            .await?
            .map(|snapshot| snapshot.active())
            .unwrap_or_default())
    }

    pub async fn list_archived(
        &self,
        collection: Collection,
        owner: &OwnerId,
    ) -> AppResult<Vec<CachedRecord>> {
        Ok(self
            .get(collection, owner)
            .await?
            .map(|snapshot| snapshot.archived())
            .unwrap_or_default())
    }

    /// Every (collection, owner) pair with a stored snapshot.
    pub async fn namespaces(&self) -> AppResult<Vec<(Collection, OwnerId)>> {
        let _read = self.gate.read().await;
        let found = self.store.keys_with_prefix(keys::CACHE_PREFIX).await?;
        Ok(found.iter().filter_map(|key| keys::parse_cache(key)).collect())
    }

    pub async fn clear_all(&self) -> AppResult<usize> {
        let _write = self.gate.write().await;
        let found = self.store.keys_with_prefix(keys::CACHE_PREFIX).await?;
        let count = found.len();
        self.store
            .apply_batch(found.into_iter().map(BatchOp::remove).collect())
            .await?;
        info!(target: "dosekeeper", event = "cache_cleared", collections = count);
        Ok(count)
    }

    /// Moves the record `old_id` to `new_id` and rewrites string references to
    /// it in the owner's other records. Returns the rewritten references.
    pub async fn remap_record_id(
        &self,
        collection: Collection,
        owner: &OwnerId,
        old_id: &str,
        new_id: &str,
    ) -> AppResult<Vec<ReferenceRewrite>> {
        let _write = self.gate.write().await;
        let mut rewrites = Vec::new();
        let mut ops = Vec::new();

        for candidate in Collection::ALL {
            let Some(mut snapshot) = self.load(candidate, owner).await? else {
                continue;
            };
            let mut touched = false;

            if candidate == collection {
                if let Some(mut record) = snapshot.remove(old_id) {
                    record.id = new_id.to_string();
                    snapshot.upsert(record);
                    touched = true;
                }
            }

            for record in snapshot.iter_mut() {
                let before = record.extra.clone();
                if record.replace_references(old_id, new_id) {
                    let mut patch = RecordPatch::new();
                    for (key, value) in &record.extra {
                        if before.get(key) != Some(value) {
                            patch = patch.set(key, value.clone());
                        }
                    }
                    rewrites.push(ReferenceRewrite {
                        collection: candidate,
                        id: record.id.clone(),
                        patch,
                    });
                    touched = true;
                }
            }

            if touched {
                ops.push(json_op(keys::cache(candidate, owner), &snapshot)?);
            }
        }

        self.store.apply_batch(ops).await?;
        Ok(rewrites)
    }

    /// Takes the writer lock for a multi-step operation such as namespace migration.
    pub(crate) async fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Batch ops that move every snapshot of `from` under `to`, merging into
    /// existing target data. Caller must hold [`Self::lock_exclusive`].
    pub(crate) async fn namespace_ops(
        &self,
        from: &OwnerId,
        to: &OwnerId,
    ) -> AppResult<(Vec<BatchOp>, usize)> {
        let mut ops = Vec::new();
        let mut moved = 0;
        for collection in Collection::ALL {
            let Some(source) = self.load(collection, from).await? else {
                continue;
            };
            moved += source.len();
            let mut target = self.load(collection, to).await?.unwrap_or_default();
            target.absorb(source);
            ops.push(json_op(keys::cache(collection, to), &target)?);
            ops.push(BatchOp::remove(keys::cache(collection, from)));
        }
        Ok((ops, moved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> OwnerId {
        OwnerId::new("u1")
    }

    #[tokio::test]
    async fn update_on_missing_record_is_noop() {
        let cache = LocalCache::new(StoreHandle::in_memory());
        let patch = RecordPatch::new().set("name", "x");
        let previous = cache
            .update_item(Collection::Habits, &owner(), "nope", &patch)
            .await
            .unwrap();
        assert!(previous.is_none());
        assert!(cache.get(Collection::Habits, &owner()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remap_moves_record_and_rewrites_references() {
        let cache = LocalCache::new(StoreHandle::in_memory());
        cache
            .save(
                Collection::Medications,
                &owner(),
                vec![CachedRecord::new("local_1_aaa").with_field("name", "A")],
            )
            .await
            .unwrap();
        cache
            .save(
                Collection::Habits,
                &owner(),
                vec![CachedRecord::new("h1").with_field("medicationId", "local_1_aaa")],
            )
            .await
            .unwrap();

        let rewrites = cache
            .remap_record_id(Collection::Medications, &owner(), "local_1_aaa", "srv-1")
            .await
            .unwrap();

        assert!(cache
            .get_item(Collection::Medications, &owner(), "local_1_aaa")
            .await
            .unwrap()
            .is_none());
        let moved = cache
            .get_item(Collection::Medications, &owner(), "srv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.str_field("name"), Some("A"));

        assert_eq!(rewrites.len(), 1);
        assert_eq!(rewrites[0].collection, Collection::Habits);
        assert_eq!(rewrites[0].patch.get("medicationId"), Some(&json!("srv-1")));
    }
}
