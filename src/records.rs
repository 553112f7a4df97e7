use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::alarms::AlarmScheduler;
use crate::config::EngineConfig;
use crate::id::new_temp_id;
use crate::logging::LogScope;
use crate::model::{CachedRecord, Collection, Habit, Medication, OwnerId, RecordPatch, TypedRecord};
use crate::queue::{Compensation, Operation, SyncService};
use crate::time::Clock;
use crate::{AppError, AppResult};

fn not_found(collection: Collection, id: &str) -> AppError {
    AppError::new("RECORD/NOT_FOUND", "The item could not be found on this device.")
        .with_context("collection", collection.as_str())
        .with_context("id", id.to_string())
}

/// Record lifecycle on top of the cache and queue: create, edit, archive,
/// restore and delete, with alarms kept in step.
#[derive(Clone)]
pub struct RecordOps {
    sync: SyncService,
    scheduler: AlarmScheduler,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl RecordOps {
    pub fn new(
        sync: SyncService,
        scheduler: AlarmScheduler,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sync,
            scheduler,
            config,
            clock,
        }
    }

    /// Caches a new record and queues its CREATE. Records without an id get
    /// a temporary one that the queue swaps for the remote id on replay.
    pub async fn create_item<T: TypedRecord>(&self, owner: &OwnerId, item: &T) -> AppResult<CachedRecord> {
        let now = self.clock.now_ms();
        let mut record = item.to_record()?;
        if record.id.trim().is_empty() {
            record.id = new_temp_id(&self.config.temp_record_prefix, now);
        }
        if self
            .sync
            .get_item_from_cache(T::COLLECTION, owner, &record.id)
            .await?
            .is_some()
        {
            return Err(AppError::new("RECORD/DUPLICATE_ID", "An item with this id already exists.")
                .with_context("id", record.id.clone()));
        }
        record.is_archived = false;
        record.archived_at = None;
        record.updated_at = now;

        self.sync
            .cache()
            .put_item(T::COLLECTION, owner, record.clone())
            .await?;
        self.sync
            .enqueue(
                Operation::Create,
                T::COLLECTION,
                &record.id,
                owner,
                record.to_document()?,
            )
            .await;
        Ok(record)
    }

    /// Applies a typed patch optimistically. The returned compensation
    /// undoes it through [`SyncService::compensate`].
    pub async fn update_item<P: Serialize>(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
        patch: &P,
    ) -> AppResult<Compensation> {
        let patch = RecordPatch::from_typed(patch)?;
        if patch.is_empty() {
            return Err(AppError::new("RECORD/EMPTY_PATCH", "Nothing to update."));
        }
        self.sync
            .apply_update(collection, owner, id, patch)
            .await?
            .ok_or_else(|| not_found(collection, id))
    }

    async fn cancel_record_alarms(&self, owner: &OwnerId, record: &CachedRecord) {
        let mut ids: Vec<String> = Vec::new();
        if let Some(current) = record.str_field("currentAlarmId") {
            ids.push(current.to_string());
        }
        if let Some(Value::Array(scheduled)) = record.field("scheduledAlarmIds") {
            ids.extend(scheduled.iter().filter_map(Value::as_str).map(str::to_owned));
        }
        for id in ids {
            if let Err(err) = self.scheduler.cancel_alarm(&id).await {
                warn!(target: "dosekeeper", event = "archive_cancel_failed", alarm_id = %id, code = err.code());
            }
        }
        if let Err(err) = self.scheduler.cancel_all_alarms_for_item(owner, &record.id).await {
            warn!(target: "dosekeeper", event = "archive_cancel_failed", item_id = %record.id, code = err.code());
        }
    }

    /// Soft delete. Alarms are cancelled and the alarm bookkeeping reset
    /// in the cache before the change is queued.
    pub async fn archive_item(&self, collection: Collection, owner: &OwnerId, id: &str) -> AppResult<CachedRecord> {
        let scope = LogScope::new("archive_item", Some(owner.as_str()));
        let Some(record) = self.sync.get_item_from_cache(collection, owner, id).await? else {
            let err = not_found(collection, id);
            scope.fail(&err);
            return Err(err);
        };
        if record.is_archived {
            return Ok(record);
        }
        self.cancel_record_alarms(owner, &record).await;

        let now = self.clock.now_ms();
        let mut patch = RecordPatch::new()
            .set("isArchived", true)
            .set("archivedAt", now)
            .set("updatedAt", now);
        if collection.item_type().is_some() {
            patch = patch
                .clear("currentAlarmId")
                .set("snoozeCount", 0)
                .clear("snoozedUntil")
                .clear("lastSnoozeAt");
        }
        if collection == Collection::Habits {
            patch = patch.set("scheduledAlarmIds", json!([]));
        }
        // Cache first; the queued copy may still fail without undoing this.
        let _applied = self.sync.apply_update(collection, owner, id, patch).await?;

        let archived = self
            .sync
            .get_item_from_cache(collection, owner, id)
            .await?
            .ok_or_else(|| not_found(collection, id))?;
        scope.success(json!({ "collection": collection.as_str(), "id": id }));
        Ok(archived)
    }

    /// Clears the archive flags and re-arms alarms the item would have.
    pub async fn restore_item(&self, collection: Collection, owner: &OwnerId, id: &str) -> AppResult<CachedRecord> {
        let scope = LogScope::new("restore_item", Some(owner.as_str()));
        let Some(record) = self.sync.get_item_from_cache(collection, owner, id).await? else {
            let err = not_found(collection, id);
            scope.fail(&err);
            return Err(err);
        };
        if !record.is_archived_for_alarms() {
            return Ok(record);
        }
        let patch = RecordPatch::new()
            .set("isArchived", false)
            .clear("archivedAt")
            .set("updatedAt", self.clock.now_ms());
        let _applied = self.sync.apply_update(collection, owner, id, patch).await?;
        let restored = self
            .sync
            .get_item_from_cache(collection, owner, id)
            .await?
            .ok_or_else(|| not_found(collection, id))?;

        let rearmed = match collection {
            Collection::Habits => {
                let habit = Habit::from_record(&restored)?;
                self.scheduler
                    .schedule_recurring_habit_alarms(owner, &habit)
                    .await
                    .map(|ids| ids.len())
            }
            Collection::Medications => {
                let medication = Medication::from_record(&restored)?;
                match medication.next_due_at {
                    Some(due) if due > self.clock.now_ms() => self
                        .scheduler
                        .schedule_medication_alarm(owner, &medication, due)
                        .await
                        .map(|_| 1),
                    _ => Ok(0),
                }
            }
            Collection::Appointments => Ok(0),
        };
        let alarms = rearmed.unwrap_or_else(|err| {
            warn!(target: "dosekeeper", event = "restore_rearm_failed", id = %id, code = err.code());
            0
        });

        scope.success(json!({ "collection": collection.as_str(), "id": id, "alarms": alarms }));
        self.sync
            .get_item_from_cache(collection, owner, id)
            .await?
            .ok_or_else(|| not_found(collection, id))
    }

    /// Removes the record for good: alarms, cache entry, then a queued DELETE.
    pub async fn hard_delete_item(&self, collection: Collection, owner: &OwnerId, id: &str) -> AppResult<CachedRecord> {
        let scope = LogScope::new("hard_delete_item", Some(owner.as_str()));
        let Some(record) = self.sync.get_item_from_cache(collection, owner, id).await? else {
            let err = not_found(collection, id);
            scope.fail(&err);
            return Err(err);
        };
        self.cancel_record_alarms(owner, &record).await;
        let removed = self
            .sync
            .remove_item_from_cache(collection, owner, id)
            .await?
            .unwrap_or(record);
        self.sync
            .enqueue(Operation::Delete, collection, id, owner, Default::default())
            .await;
        scope.success(json!({ "collection": collection.as_str(), "id": id }));
        Ok(removed)
    }

    pub async fn is_item_archived(&self, collection: Collection, owner: &OwnerId, id: &str) -> AppResult<bool> {
        Ok(self
            .sync
            .get_item_from_cache(collection, owner, id)
            .await?
            .is_some_and(|record| record.is_archived))
    }

    pub async fn list_active(&self, collection: Collection, owner: &OwnerId) -> AppResult<Vec<CachedRecord>> {
        self.sync.cache().list_active(collection, owner).await
    }

    pub async fn list_archived(&self, collection: Collection, owner: &OwnerId) -> AppResult<Vec<CachedRecord>> {
        self.sync.cache().list_archived(collection, owner).await
    }

    /// Active records decoded into their typed view.
    pub async fn active<T: TypedRecord>(&self, owner: &OwnerId) -> AppResult<Vec<T>> {
        self.list_active(T::COLLECTION, owner)
            .await?
            .iter()
            .map(T::from_record)
            .collect()
    }
}
