use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::model::{Collection, ItemType, OwnerId};
use crate::queue::NamespaceListener;
use crate::storage::{keys, StoreHandle};
use crate::{AppError, AppResult};

/// Lifecycle of one alarm occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmPhase {
    #[default]
    Scheduled,
    Fired,
    Completed,
    Dismissed,
}

impl AlarmPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AlarmPhase::Completed | AlarmPhase::Dismissed)
    }

    fn step(self, next: AlarmPhase) -> AppResult<AlarmPhase> {
        if self.is_terminal() {
            return Err(AppError::new(
                "ALARM/INVALID_TRANSITION",
                "This alarm occurrence is already resolved.",
            )
            .with_context("from", format!("{self:?}"))
            .with_context("to", format!("{next:?}")));
        }
        Ok(next)
    }

    pub fn fire(self) -> AppResult<AlarmPhase> {
        self.step(AlarmPhase::Fired)
    }

    pub fn complete(self) -> AppResult<AlarmPhase> {
        self.step(AlarmPhase::Completed)
    }

    pub fn dismiss(self) -> AppResult<AlarmPhase> {
        self.step(AlarmPhase::Dismissed)
    }

    /// A snoozed occurrence is scheduled again under a new alarm.
    pub fn snooze(self) -> AppResult<AlarmPhase> {
        self.step(AlarmPhase::Scheduled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    pub id: String,
    #[serde(rename = "ownerIdentity")]
    pub owner: OwnerId,
    pub item_type: ItemType,
    pub item_id: String,
    pub trigger_at: i64,
    #[serde(default)]
    pub snooze_count: u32,
    #[serde(default)]
    pub recurrence_key: Option<String>,
    #[serde(default)]
    pub phase: AlarmPhase,
    pub created_at: i64,
}

impl AlarmRecord {
    pub fn belongs_to(&self, owner: &OwnerId, item_id: &str) -> bool {
        &self.owner == owner && self.item_id == item_id
    }
}

#[derive(Default)]
struct RegistryState {
    alarms: Vec<AlarmRecord>,
    loaded: bool,
}

/// Durable index of alarms programmed on the device, so they can be found
/// again by item and cancelled.
#[derive(Clone)]
pub struct AlarmRegistry {
    store: StoreHandle,
    state: Arc<Mutex<RegistryState>>,
}

impl AlarmRegistry {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    async fn locked(&self) -> AppResult<MutexGuard<'_, RegistryState>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            state.alarms = self
                .store
                .get_json::<Vec<AlarmRecord>>(keys::ALARM_REGISTRY)
                .await?
                .unwrap_or_default();
            state.loaded = true;
        }
        Ok(state)
    }

    async fn persist(&self, alarms: &[AlarmRecord]) -> AppResult<()> {
        self.store.set_json(keys::ALARM_REGISTRY, alarms).await
    }

    pub async fn insert(&self, record: AlarmRecord) -> AppResult<()> {
        let mut state = self.locked().await?;
        state.alarms.retain(|existing| existing.id != record.id);
        state.alarms.push(record);
        self.persist(&state.alarms).await
    }

    pub async fn get(&self, id: &str) -> AppResult<Option<AlarmRecord>> {
        let state = self.locked().await?;
        Ok(state.alarms.iter().find(|alarm| alarm.id == id).cloned())
    }

    pub async fn all(&self, owner: Option<&OwnerId>) -> AppResult<Vec<AlarmRecord>> {
        let state = self.locked().await?;
        Ok(state
            .alarms
            .iter()
            .filter(|alarm| owner.map_or(true, |owner| &alarm.owner == owner))
            .cloned()
            .collect())
    }

    pub async fn for_item(&self, owner: &OwnerId, item_id: &str) -> AppResult<Vec<AlarmRecord>> {
        let state = self.locked().await?;
        Ok(state
            .alarms
            .iter()
            .filter(|alarm| alarm.belongs_to(owner, item_id))
            .cloned()
            .collect())
    }

    pub async fn remove(&self, id: &str) -> AppResult<Option<AlarmRecord>> {
        let mut state = self.locked().await?;
        let Some(index) = state.alarms.iter().position(|alarm| alarm.id == id) else {
            return Ok(None);
        };
        let removed = state.alarms.remove(index);
        self.persist(&state.alarms).await?;
        Ok(Some(removed))
    }

    /// Applies `change` to the alarm with `id`. Returns the updated record.
    pub async fn update<F>(&self, id: &str, change: F) -> AppResult<Option<AlarmRecord>>
    where
        F: FnOnce(&mut AlarmRecord),
    {
        let mut state = self.locked().await?;
        let Some(alarm) = state.alarms.iter_mut().find(|alarm| alarm.id == id) else {
            return Ok(None);
        };
        change(alarm);
        let updated = alarm.clone();
        self.persist(&state.alarms).await?;
        Ok(Some(updated))
    }

    pub async fn len(&self) -> AppResult<usize> {
        Ok(self.locked().await?.alarms.len())
    }

    async fn rewrite<F>(&self, change: F) -> AppResult<usize>
    where
        F: Fn(&mut AlarmRecord) -> bool,
    {
        let mut state = self.locked().await?;
        let mut changed = 0;
        for alarm in state.alarms.iter_mut() {
            if change(alarm) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist(&state.alarms).await?;
        }
        Ok(changed)
    }
}

#[async_trait]
impl NamespaceListener for AlarmRegistry {
    async fn on_owner_migrated(&self, from: &OwnerId, to: &OwnerId) -> AppResult<()> {
        let moved = self
            .rewrite(|alarm| {
                if &alarm.owner != from {
                    return false;
                }
                alarm.owner = to.clone();
                true
            })
            .await?;
        info!(
            target: "dosekeeper",
            event = "alarm_owner_migrated",
            from = %from,
            to = %to,
            alarms = moved
        );
        Ok(())
    }

    async fn on_record_id_remapped(
        &self,
        owner: &OwnerId,
        collection: Collection,
        from: &str,
        to: &str,
    ) -> AppResult<()> {
        let Some(item_type) = collection.item_type() else {
            return Ok(());
        };
        self.rewrite(|alarm| {
            if &alarm.owner != owner || alarm.item_type != item_type || alarm.item_id != from {
                return false;
            }
            alarm.item_id = to.to_string();
            true
        })
        .await?;
        Ok(())
    }
}
