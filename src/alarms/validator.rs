use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{AlarmScheduler, FiredAlarm};
use crate::logging::LogScope;
use crate::model::{CachedCollection, Collection, OwnerId};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub archived: usize,
}

/// Fire-time and start-up checks that keep device alarms in line with the
/// records they belong to.
#[derive(Clone)]
pub struct AlarmValidator {
    scheduler: AlarmScheduler,
}

impl AlarmValidator {
    pub fn new(scheduler: AlarmScheduler) -> Self {
        Self { scheduler }
    }

    /// Re-reads the owning record when an alarm fires. Archived or deleted
    /// items lose every alarm and the alarm is not shown. Anything that
    /// cannot be checked is shown.
    pub async fn should_show_alarm(&self, fired: &FiredAlarm) -> bool {
        let payload = &fired.payload;
        if payload.owner.as_str().is_empty() || payload.item_id.is_empty() {
            return true;
        }
        let collection = payload.item_type.collection();
        let snapshot = match self.scheduler.sync.get_from_cache(collection, &payload.owner).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    target: "dosekeeper",
                    event = "alarm_check_failed",
                    alarm_id = %fired.alarm_id,
                    code = err.code()
                );
                return true;
            }
        };
        // No snapshot at all means the cache was never filled for this owner.
        let Some(snapshot) = snapshot else {
            return true;
        };

        let reason = match snapshot.get(&payload.item_id) {
            None => "missing",
            Some(record) if record.is_archived_for_alarms() => "archived",
            Some(_) => {
                if let Err(err) = self.scheduler.mark_fired(&fired.alarm_id).await {
                    warn!(target: "dosekeeper", event = "alarm_mark_fired_failed", code = err.code());
                }
                return true;
            }
        };

        self.suppress(fired, reason).await;
        false
    }

    async fn suppress(&self, fired: &FiredAlarm, reason: &str) {
        let payload = &fired.payload;
        let mut cancelled = match self
            .scheduler
            .cancel_all_alarms_for_item(&payload.owner, &payload.item_id)
            .await
        {
            Ok(cancelled) => cancelled,
            Err(err) => {
                warn!(target: "dosekeeper", event = "alarm_suppress_cancel_failed", code = err.code());
                0
            }
        };
        // The fired alarm may already be gone from the registry.
        if let Ok(true) = self.scheduler.cancel_alarm(&fired.alarm_id).await {
            cancelled += 1;
        }
        info!(
            target: "dosekeeper",
            event = "alarm_suppressed",
            alarm_id = %fired.alarm_id,
            item_id = %payload.item_id,
            reason,
            cancelled
        );
    }

    /// Cancels alarms whose trigger time lies further back than the grace window.
    pub async fn cleanup_expired_alarms(&self) -> AppResult<usize> {
        let cutoff = self.scheduler.clock.now_ms() - self.scheduler.config.expired_alarm_grace_ms;
        let mut cancelled = 0;
        for alarm in self.scheduler.get_all_alarms(None).await? {
            if alarm.trigger_at < cutoff && self.scheduler.cancel_alarm(&alarm.id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Cancels alarms whose record is archived. Limited to one owner when given.
    pub async fn cleanup_archived_item_alarms(&self, owner: Option<&OwnerId>) -> AppResult<usize> {
        let mut snapshots: HashMap<(Collection, OwnerId), Option<CachedCollection>> = HashMap::new();
        let mut cancelled = 0;
        for alarm in self.scheduler.get_all_alarms(owner).await? {
            let key = (alarm.item_type.collection(), alarm.owner.clone());
            if !snapshots.contains_key(&key) {
                let snapshot = self.scheduler.sync.get_from_cache(key.0, &key.1).await?;
                snapshots.insert(key.clone(), snapshot);
            }
            let archived = snapshots
                .get(&key)
                .and_then(|snapshot| snapshot.as_ref())
                .and_then(|snapshot| snapshot.get(&alarm.item_id))
                .is_some_and(|record| record.is_archived_for_alarms());
            if archived && self.scheduler.cancel_alarm(&alarm.id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Start-up sweep: expired alarms first, then alarms of archived items.
    pub async fn perform_alarm_maintenance(&self) -> AppResult<MaintenanceReport> {
        let scope = LogScope::new("alarm_maintenance", None);
        let result = async {
            let expired = self.cleanup_expired_alarms().await?;
            let archived = self.cleanup_archived_item_alarms(None).await?;
            Ok::<_, AppError>(MaintenanceReport { expired, archived })
        }
        .await;
        match &result {
            Ok(report) => scope.success(json!(report)),
            Err(err) => scope.fail(err),
        }
        result
    }
}
