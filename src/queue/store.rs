use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::item::{Operation, QueueItem, QueueStatus};
use crate::id::new_uuid_v7;
use crate::model::{Collection, OwnerId, RecordPatch};
use crate::storage::{json_op, keys, BatchOp, StoreHandle};
use crate::time::now_ms;
use crate::AppResult;

#[derive(Default)]
struct QueueState {
    items: Vec<QueueItem>,
    loaded: bool,
}

/// Ordered, durable log of pending remote mutations. Every change is
/// persisted before the lock is released.
#[derive(Clone)]
pub struct MutationQueue {
    store: StoreHandle,
    state: Arc<Mutex<QueueState>>,
}

impl MutationQueue {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    async fn locked(&self) -> AppResult<MutexGuard<'_, QueueState>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            state.items = self
                .store
                .get_json::<Vec<QueueItem>>(keys::QUEUE_ITEMS)
                .await?
                .unwrap_or_default();
            state.loaded = true;
        }
        Ok(state)
    }

    async fn persist(&self, items: &[QueueItem]) -> AppResult<()> {
        self.store.set_json(keys::QUEUE_ITEMS, items).await
    }

    /// Resets items a crash left `IN_FLIGHT` back to `PENDING`.
    pub async fn recover(&self) -> AppResult<usize> {
        let mut state = self.locked().await?;
        let mut recovered = 0;
        for item in state.items.iter_mut() {
            if item.status == QueueStatus::InFlight {
                item.status = QueueStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.persist(&state.items).await?;
            info!(target: "dosekeeper", event = "queue_recovered", items = recovered);
        }
        Ok(recovered)
    }

    /// Appends a mutation. Never fails: the cache already holds the user's
    /// view, so problems are logged. An item whose write did not reach
    /// storage stays queued in memory and is persisted with the next change.
    pub async fn enqueue(
        &self,
        operation: Operation,
        collection: Collection,
        item_id: &str,
        owner: &OwnerId,
        payload: Map<String, Value>,
    ) -> Option<String> {
        let mut state = match self.locked().await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    target: "dosekeeper",
                    event = "queue_enqueue_failed",
                    stage = "load",
                    operation = operation.as_str(),
                    collection = collection.as_str(),
                    item_id = %item_id,
                    error = %err
                );
                return None;
            }
        };
        let item = QueueItem {
            id: new_uuid_v7(),
            operation,
            collection,
            item_id: item_id.to_string(),
            owner: owner.clone(),
            payload,
            enqueued_at: now_ms(),
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
        };
        let id = item.id.clone();
        state.items.push(item);
        if let Err(err) = self.persist(&state.items).await {
            warn!(
                target: "dosekeeper",
                event = "queue_enqueue_failed",
                stage = "persist",
                operation = operation.as_str(),
                collection = collection.as_str(),
                item_id = %item_id,
                error = %err
            );
        }
        Some(id)
    }

    pub async fn get(&self, id: &str) -> AppResult<Option<QueueItem>> {
        let state = self.locked().await?;
        Ok(state.items.iter().find(|item| item.id == id).cloned())
    }

    pub async fn items(&self, owner: Option<&OwnerId>) -> AppResult<Vec<QueueItem>> {
        let state = self.locked().await?;
        Ok(state
            .items
            .iter()
            .filter(|item| owner.map_or(true, |o| &item.owner == o))
            .cloned()
            .collect())
    }

    /// Items still waiting to reach the remote store, whatever their status.
    pub async fn pending_count(&self, owner: Option<&OwnerId>) -> usize {
        match self.items(owner).await {
            Ok(items) => items.len(),
            Err(err) => {
                warn!(target: "dosekeeper", event = "queue_count_failed", error = %err);
                0
            }
        }
    }

    async fn modify<F>(&self, id: &str, f: F) -> AppResult<bool>
    where
        F: FnOnce(&mut Vec<QueueItem>, usize),
    {
        let mut state = self.locked().await?;
        let Some(index) = state.items.iter().position(|item| item.id == id) else {
            return Ok(false);
        };
        f(&mut state.items, index);
        self.persist(&state.items).await?;
        Ok(true)
    }

    pub async fn mark_in_flight(&self, id: &str) -> AppResult<bool> {
        self.modify(id, |items, index| {
            items[index].status = QueueStatus::InFlight;
            items[index].attempts += 1;
        })
        .await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> AppResult<bool> {
        let error = error.to_string();
        self.modify(id, move |items, index| {
            items[index].status = QueueStatus::Failed;
            items[index].last_error = Some(error);
        })
        .await
    }

    /// Removes an item, whether acknowledged or permanently rejected.
    pub async fn remove(&self, id: &str) -> AppResult<bool> {
        self.modify(id, |items, index| {
            items.remove(index);
        })
        .await
    }

    /// Points later items for `from` at `to` and rewrites references in payloads.
    pub async fn remap_item_id(&self, owner: &OwnerId, from: &str, to: &str) -> AppResult<usize> {
        let mut state = self.locked().await?;
        let mut touched = 0;
        for item in state.items.iter_mut().filter(|item| &item.owner == owner) {
            let mut changed = false;
            if item.item_id == from {
                item.item_id = to.to_string();
                changed = true;
            }
            let mut payload = RecordPatch::from_map(std::mem::take(&mut item.payload));
            changed |= payload.replace_references(from, to);
            item.payload = payload.into_map();
            if changed {
                touched += 1;
            }
        }
        if touched > 0 {
            self.persist(&state.items).await?;
        }
        Ok(touched)
    }

    /// Moves every item of `from` under `to` and writes `extra` in the same
    /// atomic batch. In-memory state only changes once the batch lands.
    pub(crate) async fn migrate_owner_with(
        &self,
        from: &OwnerId,
        to: &OwnerId,
        mut extra: Vec<BatchOp>,
    ) -> AppResult<usize> {
        let mut state = self.locked().await?;
        let mut next = state.items.clone();
        let mut moved = 0;
        for item in next.iter_mut().filter(|item| &item.owner == from) {
            item.owner = to.clone();
            moved += 1;
        }
        if moved > 0 {
            extra.push(json_op(keys::QUEUE_ITEMS, &next)?);
        }
        self.store.apply_batch(extra).await?;
        state.items = next;
        Ok(moved)
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
    async fn enqueue_persists_and_reloads_in_order() {
        let store = StoreHandle::in_memory();
        let queue = MutationQueue::new(store.clone());
        queue
            .enqueue(Operation::Create, Collection::Habits, "h1", &owner(), Map::new())
            .await
            .unwrap();
        queue
            .enqueue(Operation::Delete, Collection::Habits, "h1", &owner(), Map::new())
            .await
            .unwrap();

        let reloaded = MutationQueue::new(store);
        let items = reloaded.items(None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].operation, Operation::Create);
        assert_eq!(items[1].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn recover_resets_in_flight() {
        let store = StoreHandle::in_memory();
        let queue = MutationQueue::new(store.clone());
        let id = queue
            .enqueue(Operation::Update, Collection::Medications, "m1", &owner(), Map::new())
            .await
            .unwrap();
        queue.mark_in_flight(&id).await.unwrap();

        let restarted = MutationQueue::new(store);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        let item = restarted.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempts, 1);
    }

    #[tokio::test]
    async fn remap_rewrites_ids_and_payload_references() {
        let queue = MutationQueue::new(StoreHandle::in_memory());
        queue
            .enqueue(Operation::Update, Collection::Medications, "local_1", &owner(), Map::new())
            .await;
        let mut payload = Map::new();
        payload.insert("medicationId".into(), json!("local_1"));
        queue
            .enqueue(Operation::Update, Collection::Habits, "h1", &owner(), payload)
            .await;

        assert_eq!(queue.remap_item_id(&owner(), "local_1", "srv").await.unwrap(), 2);
        let items = queue.items(Some(&owner())).await.unwrap();
        assert_eq!(items[0].item_id, "srv");
        assert_eq!(items[1].payload["medicationId"], json!("srv"));
    }
}
