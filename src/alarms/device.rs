use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::new_uuid_v7;
use crate::model::{ItemType, OwnerId};
use crate::{AppError, AppResult};

/// Data handed to the platform alarm and returned unchanged when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmPayload {
    #[serde(rename = "ownerIdentity")]
    pub owner: OwnerId,
    pub item_type: ItemType,
    pub item_id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub snooze_count: u32,
    #[serde(default)]
    pub recurrence_key: Option<String>,
}

/// A device alarm that went off.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredAlarm {
    pub alarm_id: String,
    pub trigger_at: i64,
    pub payload: AlarmPayload,
}

/// One-shot alarms programmed on the device.
#[async_trait]
pub trait DeviceAlarms: Send + Sync {
    async fn schedule(&self, trigger_at: i64, payload: &AlarmPayload) -> AppResult<String>;

    /// Cancelling an unknown id is not an error.
    async fn cancel(&self, alarm_id: &str) -> AppResult<()>;
}

#[derive(Default)]
struct Programmed {
    alarms: BTreeMap<String, (i64, AlarmPayload)>,
    fail_schedule: bool,
}

/// In-process device alarms. `take_due` plays the role of the platform
/// firing them.
#[derive(Clone, Default)]
pub struct MemoryDeviceAlarms {
    inner: Arc<Mutex<Programmed>>,
}

impl MemoryDeviceAlarms {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Programmed> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following `schedule` call fail until reset.
    pub fn set_fail_schedule(&self, fail: bool) {
        self.lock().fail_schedule = fail;
    }

    pub fn len(&self) -> usize {
        self.lock().alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().alarms.is_empty()
    }

    pub fn is_scheduled(&self, alarm_id: &str) -> bool {
        self.lock().alarms.contains_key(alarm_id)
    }

    pub fn scheduled(&self) -> Vec<FiredAlarm> {
        self.lock()
            .alarms
            .iter()
            .map(|(id, (trigger_at, payload))| FiredAlarm {
                alarm_id: id.clone(),
                trigger_at: *trigger_at,
                payload: payload.clone(),
            })
            .collect()
    }

    /// Removes and returns every alarm whose trigger time is at or before `now`.
    pub fn take_due(&self, now: i64) -> Vec<FiredAlarm> {
        let mut guard = self.lock();
        let due: Vec<String> = guard
            .alarms
            .iter()
            .filter(|(_, (trigger_at, _))| *trigger_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut fired: Vec<FiredAlarm> = due
            .into_iter()
            .filter_map(|id| {
                guard.alarms.remove(&id).map(|(trigger_at, payload)| FiredAlarm {
                    alarm_id: id,
                    trigger_at,
                    payload,
                })
            })
            .collect();
        fired.sort_by_key(|alarm| alarm.trigger_at);
        fired
    }
}

#[async_trait]
impl DeviceAlarms for MemoryDeviceAlarms {
    async fn schedule(&self, trigger_at: i64, payload: &AlarmPayload) -> AppResult<String> {
        let mut guard = self.lock();
        if guard.fail_schedule {
            return Err(AppError::new(
                "ALARM/SCHEDULE_FAILED",
                "The device refused to schedule the alarm.",
            ));
        }
        let id = new_uuid_v7();
        guard.alarms.insert(id.clone(), (trigger_at, payload.clone()));
        Ok(id)
    }

    async fn cancel(&self, alarm_id: &str) -> AppResult<()> {
        self.lock().alarms.remove(alarm_id);
        Ok(())
    }
}
