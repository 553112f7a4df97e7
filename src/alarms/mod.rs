use std::sync::Arc;

use chrono_tz::Tz;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::logging::LogScope;
use crate::model::{
    AlarmStatePatch, Collection, Habit, ItemType, Medication, OwnerId, RecordPatch, TypedRecord,
};
use crate::queue::SyncService;
use crate::time::{interval_ms, parse_time_of_day, to_date, Clock, MINUTE_MS};
use crate::{AppError, AppResult};

mod device;
mod events;
mod recurrence;
mod registry;
mod validator;

pub use device::{AlarmPayload, DeviceAlarms, FiredAlarm, MemoryDeviceAlarms};
pub use events::{ChannelSink, ComplianceEvent, EventSink, LogSink, RecordingSink};
pub use recurrence::{check_weekday, next_occurrence, parse_recurrence_key, recurrence_key};
pub use registry::{AlarmPhase, AlarmRecord, AlarmRegistry};
pub use validator::{AlarmValidator, MaintenanceReport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteOutcome {
    pub next_alarm_id: Option<String>,
    pub next_due_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnoozeOutcome {
    pub alarm_id: String,
    pub snooze_count: u32,
    pub trigger_at: i64,
    pub non_compliance: bool,
}

/// Programs device alarms for medications and habits and runs the
/// complete/snooze/dismiss transitions. Every transition is written to the
/// cache and queued for the remote store.
#[derive(Clone)]
pub struct AlarmScheduler {
    device: Arc<dyn DeviceAlarms>,
    registry: AlarmRegistry,
    sync: SyncService,
    sink: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    zone: Tz,
}

impl AlarmScheduler {
    pub fn new(
        device: Arc<dyn DeviceAlarms>,
        registry: AlarmRegistry,
        sync: SyncService,
        sink: Arc<dyn EventSink>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let zone = config.resolve_timezone();
        Self {
            device,
            registry,
            sync,
            sink,
            config,
            clock,
            zone,
        }
    }

    pub fn registry(&self) -> &AlarmRegistry {
        &self.registry
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    fn medication_payload(owner: &OwnerId, medication: &Medication) -> AlarmPayload {
        AlarmPayload {
            owner: owner.clone(),
            item_type: ItemType::Med,
            item_id: medication.id.clone(),
            title: medication.name.clone(),
            body: medication.dose_label.clone(),
            snooze_count: medication.snooze_count,
            recurrence_key: None,
        }
    }

    fn habit_payload(owner: &OwnerId, habit: &Habit, recurrence: Option<String>) -> AlarmPayload {
        AlarmPayload {
            owner: owner.clone(),
            item_type: ItemType::Habit,
            item_id: habit.id.clone(),
            title: habit.name.clone(),
            body: None,
            snooze_count: habit.snooze_count,
            recurrence_key: recurrence,
        }
    }

    /// Schedules on the device, then records it. A registry failure takes
    /// the device alarm back out.
    async fn program(&self, payload: AlarmPayload, trigger_at: i64) -> AppResult<AlarmRecord> {
        let id = self.device.schedule(trigger_at, &payload).await?;
        let record = AlarmRecord {
            id,
            owner: payload.owner,
            item_type: payload.item_type,
            item_id: payload.item_id,
            trigger_at,
            snooze_count: payload.snooze_count,
            recurrence_key: payload.recurrence_key,
            phase: AlarmPhase::Scheduled,
            created_at: self.clock.now_ms(),
        };
        if let Err(err) = self.registry.insert(record.clone()).await {
            let _ = self.device.cancel(&record.id).await;
            return Err(err);
        }
        debug!(
            target: "dosekeeper",
            event = "alarm_scheduled",
            alarm_id = %record.id,
            item_type = record.item_type.as_str(),
            item_id = %record.item_id,
            trigger_at = record.trigger_at
        );
        Ok(record)
    }

    async fn load<T: TypedRecord>(&self, owner: &OwnerId, id: &str) -> AppResult<Option<T>> {
        match self.sync.get_item_from_cache(T::COLLECTION, owner, id).await? {
            Some(record) => Ok(Some(T::from_record(&record)?)),
            None => Ok(None),
        }
    }

    async fn persist(
        &self,
        collection: Collection,
        owner: &OwnerId,
        id: &str,
        patch: AlarmStatePatch,
    ) -> AppResult<()> {
        let applied = self
            .sync
            .apply_update(collection, owner, id, RecordPatch::from_typed(&patch)?)
            .await?;
        if applied.is_none() {
            debug!(
                target: "dosekeeper",
                event = "alarm_state_not_persisted",
                collection = collection.as_str(),
                id = %id,
                reason = "not_cached"
            );
        }
        Ok(())
    }

    fn emit(&self, event: ComplianceEvent) {
        let kind = event.kind();
        if let Err(err) = self.sink.emit(event) {
            warn!(
                target: "dosekeeper",
                event = "compliance_emit_failed",
                kind,
                code = err.code()
            );
        }
    }

    pub async fn schedule_medication_alarm(
        &self,
        owner: &OwnerId,
        medication: &Medication,
        trigger_at: i64,
    ) -> AppResult<String> {
        if medication.is_archived {
            return Err(archived_error(&medication.id));
        }
        if let Some(current) = &medication.current_alarm_id {
            self.cancel_alarm(current).await?;
        }
        let record = self
            .program(Self::medication_payload(owner, medication), trigger_at)
            .await?;
        let mut patch = AlarmStatePatch::at(self.clock.now_ms());
        patch.current_alarm_id = Some(Some(record.id.clone()));
        patch.next_due_at = Some(trigger_at);
        self.persist(Collection::Medications, owner, &medication.id, patch)
            .await?;
        Ok(record.id)
    }

    /// One-shot habit alarm, tracked as the habit's live alarm.
    pub async fn schedule_habit_alarm(&self, owner: &OwnerId, habit: &Habit, trigger_at: i64) -> AppResult<String> {
        if habit.is_archived {
            return Err(archived_error(&habit.id));
        }
        if let Some(current) = &habit.current_alarm_id {
            self.cancel_alarm(current).await?;
        }
        let record = self
            .program(Self::habit_payload(owner, habit, None), trigger_at)
            .await?;
        let mut patch = AlarmStatePatch::at(self.clock.now_ms());
        patch.current_alarm_id = Some(Some(record.id.clone()));
        self.persist(Collection::Habits, owner, &habit.id, patch).await?;
        Ok(record.id)
    }

    /// Replaces the habit's weekly alarms with one per day x time slot and
    /// stores their ids on the habit.
    pub async fn schedule_recurring_habit_alarms(&self, owner: &OwnerId, habit: &Habit) -> AppResult<Vec<String>> {
        let scope = LogScope::new("schedule_recurring_habit_alarms", Some(owner.as_str()));
        let mut slots = Vec::with_capacity(habit.days.len() * habit.times.len());
        for day in &habit.days {
            check_weekday(*day)?;
            for time in &habit.times {
                slots.push((*day, parse_time_of_day(time)?));
            }
        }

        for id in &habit.scheduled_alarm_ids {
            self.cancel_alarm(id).await?;
        }
        for stale in self.registry.for_item(owner, &habit.id).await? {
            if stale.recurrence_key.is_some() {
                self.cancel_alarm(&stale.id).await?;
            }
        }

        let mut ids = Vec::with_capacity(slots.len());
        if !habit.is_archived {
            let now = self.clock.now();
            for (day, time) in slots {
                let trigger = next_occurrence(day, time, now, self.zone)?;
                let key = recurrence_key(day, time);
                let record = self
                    .program(
                        Self::habit_payload(owner, habit, Some(key)),
                        trigger.timestamp_millis(),
                    )
                    .await?;
                ids.push(record.id);
            }
        }

        let mut patch = AlarmStatePatch::at(self.clock.now_ms());
        patch.scheduled_alarm_ids = Some(ids.clone());
        self.persist(Collection::Habits, owner, &habit.id, patch).await?;
        scope.success(json!({ "habit": habit.id, "alarms": ids.len() }));
        Ok(ids)
    }

    /// Re-arms the weekly slot of a resolved recurring alarm and returns the
    /// habit's updated alarm ids.
    async fn rearm_slot(&self, owner: &OwnerId, habit: &Habit, key: &str, resolved: &FiredAlarm) -> Vec<String> {
        let mut ids: Vec<String> = habit
            .scheduled_alarm_ids
            .iter()
            .filter(|id| *id != &resolved.alarm_id)
            .cloned()
            .collect();
        if habit.is_archived {
            return ids;
        }
        let after = self.clock.now_ms().max(resolved.trigger_at);
        let next = parse_recurrence_key(key)
            .and_then(|(day, time)| next_occurrence(day, time, to_date(after), self.zone));
        let rearmed = match next {
            Ok(trigger) => {
                self.program(
                    Self::habit_payload(owner, habit, Some(key.to_string())),
                    trigger.timestamp_millis(),
                )
                .await
            }
            Err(err) => Err(err),
        };
        match rearmed {
            Ok(record) => ids.push(record.id),
            Err(err) => warn!(
                target: "dosekeeper",
                event = "habit_slot_rearm_failed",
                habit = %habit.id,
                key,
                code = err.code()
            ),
        }
        ids
    }

    /// Device cancel failures are logged; the registry entry goes either way.
    pub async fn cancel_alarm(&self, alarm_id: &str) -> AppResult<bool> {
        if let Err(err) = self.device.cancel(alarm_id).await {
            warn!(
                target: "dosekeeper",
                event = "device_cancel_failed",
                alarm_id = %alarm_id,
                code = err.code()
            );
        }
        Ok(self.registry.remove(alarm_id).await?.is_some())
    }

    pub async fn cancel_all_alarms_for_item(&self, owner: &OwnerId, item_id: &str) -> AppResult<usize> {
        let alarms = self.registry.for_item(owner, item_id).await?;
        let mut cancelled = 0;
        for alarm in &alarms {
            if self.cancel_alarm(&alarm.id).await? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(
                target: "dosekeeper",
                event = "item_alarms_cancelled",
                owner = %owner,
                item_id = %item_id,
                cancelled
            );
        }
        Ok(cancelled)
    }

    pub async fn get_all_alarms(&self, owner: Option<&OwnerId>) -> AppResult<Vec<AlarmRecord>> {
        self.registry.all(owner).await
    }

    pub async fn get_alarms_for_item(&self, owner: &OwnerId, item_id: &str) -> AppResult<Vec<AlarmRecord>> {
        self.registry.for_item(owner, item_id).await
    }

    pub async fn mark_fired(&self, alarm_id: &str) -> AppResult<()> {
        let Some(record) = self.registry.get(alarm_id).await? else {
            return Ok(());
        };
        let phase = record.phase.fire()?;
        self.registry.update(alarm_id, |alarm| alarm.phase = phase).await?;
        Ok(())
    }

    /// Checks the transition and retires the occurrence from device and registry.
    async fn retire(
        &self,
        fired: &FiredAlarm,
        step: fn(AlarmPhase) -> AppResult<AlarmPhase>,
    ) -> AppResult<()> {
        // An occurrence leaves the registry when it is resolved, so a missing
        // entry means this one was already handled.
        let Some(record) = self.registry.get(&fired.alarm_id).await? else {
            return Err(AppError::new(
                "ALARM/INVALID_TRANSITION",
                "This alarm occurrence is already resolved.",
            )
            .with_context("alarm_id", fired.alarm_id.clone()));
        };
        step(record.phase)?;
        self.cancel_alarm(&fired.alarm_id).await?;
        Ok(())
    }

    pub async fn complete_alarm(&self, fired: &FiredAlarm) -> AppResult<CompleteOutcome> {
        let payload = &fired.payload;
        let scope = LogScope::new("complete_alarm", Some(payload.owner.as_str()));
        self.retire(fired, AlarmPhase::complete).await?;
        let now = self.clock.now_ms();

        let outcome = match payload.item_type {
            ItemType::Med => {
                let Some(medication) = self.load::<Medication>(&payload.owner, &payload.item_id).await? else {
                    scope.warn(json!({ "item_id": payload.item_id, "reason": "missing" }));
                    return Ok(CompleteOutcome::default());
                };
                let (outcome, snoozes) = self.complete_medication(&payload.owner, &medication, now).await?;
                self.emit(ComplianceEvent::Completed {
                    owner: payload.owner.clone(),
                    item_type: ItemType::Med,
                    item_id: payload.item_id.clone(),
                    alarm_id: fired.alarm_id.clone(),
                    snoozes_before: snoozes,
                    at: now,
                });
                outcome
            }
            ItemType::Habit => {
                let Some(habit) = self.load::<Habit>(&payload.owner, &payload.item_id).await? else {
                    scope.warn(json!({ "item_id": payload.item_id, "reason": "missing" }));
                    return Ok(CompleteOutcome::default());
                };
                let mut patch = AlarmStatePatch::at(now).reset_snooze();
                patch.last_completed_at = Some(now);
                if let Some(key) = &payload.recurrence_key {
                    patch.scheduled_alarm_ids = Some(self.rearm_slot(&payload.owner, &habit, key, fired).await);
                }
                self.persist(Collection::Habits, &payload.owner, &habit.id, patch)
                    .await?;
                self.emit(ComplianceEvent::Completed {
                    owner: payload.owner.clone(),
                    item_type: ItemType::Habit,
                    item_id: payload.item_id.clone(),
                    alarm_id: fired.alarm_id.clone(),
                    snoozes_before: habit.snooze_count,
                    at: now,
                });
                CompleteOutcome::default()
            }
        };

        scope.success(json!({
            "item_id": payload.item_id,
            "next_alarm_id": outcome.next_alarm_id,
        }));
        Ok(outcome)
    }

    /// Records the dose and chains the next alarm when the medication has
    /// an interval. Returns the outcome and the snoozes before completion.
    async fn complete_medication(
        &self,
        owner: &OwnerId,
        medication: &Medication,
        now: i64,
    ) -> AppResult<(CompleteOutcome, u32)> {
        let mut patch = AlarmStatePatch::at(now).reset_snooze();
        patch.last_taken_at = Some(now);
        if let Some(on_hand) = medication.quantity_on_hand {
            let per_dose = medication.quantity_per_dose.unwrap_or(1.0);
            patch.quantity_on_hand = Some((on_hand - per_dose).max(0.0));
        }

        let interval = match medication.interval.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => interval_ms(raw).unwrap_or_else(|err| {
                warn!(
                    target: "dosekeeper",
                    event = "medication_interval_invalid",
                    id = %medication.id,
                    code = err.code()
                );
                0
            }),
            _ => 0,
        };

        // The chained dose replaces whatever alarm the medication still points at.
        if let Some(current) = &medication.current_alarm_id {
            self.cancel_alarm(current).await?;
            patch.current_alarm_id = Some(None);
        }

        let mut outcome = CompleteOutcome::default();
        if interval > 0 && !medication.is_archived {
            let next_due = now + interval;
            patch.next_due_at = Some(next_due);
            outcome.next_due_at = Some(next_due);
            let mut payload = Self::medication_payload(owner, medication);
            payload.snooze_count = 0;
            match self.program(payload, next_due).await {
                Ok(record) => {
                    patch.current_alarm_id = Some(Some(record.id.clone()));
                    outcome.next_alarm_id = Some(record.id);
                }
                Err(err) => warn!(
                    target: "dosekeeper",
                    event = "next_dose_schedule_failed",
                    id = %medication.id,
                    code = err.code()
                ),
            }
        }

        self.persist(Collection::Medications, owner, &medication.id, patch)
            .await?;
        Ok((outcome, medication.snooze_count))
    }

    /// Defers the occurrence by `minutes` (config default when `None`).
    /// Reaching the configured threshold emits a non-compliance event;
    /// there is no upper limit on snoozes.
    pub async fn snooze_alarm(&self, fired: &FiredAlarm, minutes: Option<u32>) -> AppResult<SnoozeOutcome> {
        let payload = &fired.payload;
        let minutes = minutes.unwrap_or(self.config.default_snooze_minutes);
        if minutes == 0 {
            return Err(AppError::new(
                "ALARM/INVALID_SNOOZE",
                "Snooze length must be at least one minute.",
            ));
        }
        let scope = LogScope::new("snooze_alarm", Some(payload.owner.as_str()));
        let collection = payload.item_type.collection();
        let record = self
            .sync
            .get_item_from_cache(collection, &payload.owner, &payload.item_id)
            .await?;
        let Some(record) = record else {
            self.cancel_alarm(&fired.alarm_id).await?;
            let err = AppError::new("RECORD/NOT_FOUND", "The item for this alarm no longer exists.")
                .with_context("item_id", payload.item_id.clone());
            scope.fail(&err);
            return Err(err);
        };
        if record.is_archived_for_alarms() {
            self.cancel_all_alarms_for_item(&payload.owner, &payload.item_id)
                .await?;
            self.cancel_alarm(&fired.alarm_id).await?;
            let err = archived_error(&payload.item_id);
            scope.fail(&err);
            return Err(err);
        }
        self.retire(fired, AlarmPhase::snooze).await?;

        let now = self.clock.now_ms();
        let until = now + i64::from(minutes) * MINUTE_MS;
        let (current_count, habit) = match payload.item_type {
            ItemType::Med => (Medication::from_record(&record)?.snooze_count, None),
            ItemType::Habit => {
                let habit = Habit::from_record(&record)?;
                (habit.snooze_count, Some(habit))
            }
        };
        let snooze_count = current_count + 1;

        let mut next = payload.clone();
        next.snooze_count = snooze_count;
        next.recurrence_key = None;
        let alarm = self.program(next, until).await?;

        let mut patch = AlarmStatePatch::at(now);
        patch.current_alarm_id = Some(Some(alarm.id.clone()));
        patch.snooze_count = Some(snooze_count);
        patch.snoozed_until = Some(Some(until));
        patch.last_snooze_at = Some(Some(now));
        if payload.item_type == ItemType::Med {
            patch.next_due_at = Some(until);
        }
        if let (Some(habit), Some(key)) = (&habit, &payload.recurrence_key) {
            patch.scheduled_alarm_ids = Some(self.rearm_slot(&payload.owner, habit, key, fired).await);
        }
        self.persist(collection, &payload.owner, &payload.item_id, patch)
            .await?;

        self.emit(ComplianceEvent::Snoozed {
            owner: payload.owner.clone(),
            item_type: payload.item_type,
            item_id: payload.item_id.clone(),
            alarm_id: alarm.id.clone(),
            snooze_count,
            until,
        });
        let threshold = self.config.snooze_notify_threshold;
        let non_compliance = snooze_count >= threshold;
        if non_compliance {
            self.emit(ComplianceEvent::NonCompliance {
                owner: payload.owner.clone(),
                item_type: payload.item_type,
                item_id: payload.item_id.clone(),
                snooze_count,
                threshold,
                at: now,
            });
        }

        scope.success(json!({
            "item_id": payload.item_id,
            "snooze_count": snooze_count,
            "non_compliance": non_compliance,
        }));
        Ok(SnoozeOutcome {
            alarm_id: alarm.id,
            snooze_count,
            trigger_at: until,
            non_compliance,
        })
    }

    pub async fn dismiss_alarm(&self, fired: &FiredAlarm) -> AppResult<()> {
        let payload = &fired.payload;
        let scope = LogScope::new("dismiss_alarm", Some(payload.owner.as_str()));
        self.retire(fired, AlarmPhase::dismiss).await?;
        let now = self.clock.now_ms();

        let mut patch = AlarmStatePatch::at(now).reset_snooze();
        patch.last_dismissed_at = Some(now);
        if let (ItemType::Habit, Some(key)) = (payload.item_type, &payload.recurrence_key) {
            if let Some(habit) = self.load::<Habit>(&payload.owner, &payload.item_id).await? {
                patch.scheduled_alarm_ids = Some(self.rearm_slot(&payload.owner, &habit, key, fired).await);
            }
        }
        self.persist(payload.item_type.collection(), &payload.owner, &payload.item_id, patch)
            .await?;

        self.emit(ComplianceEvent::Dismissed {
            owner: payload.owner.clone(),
            item_type: payload.item_type,
            item_id: payload.item_id.clone(),
            alarm_id: fired.alarm_id.clone(),
            at: now,
        });
        scope.success(json!({ "item_id": payload.item_id }));
        Ok(())
    }
}

fn archived_error(id: &str) -> AppError {
    AppError::new("ALARM/ITEM_ARCHIVED", "Archived items cannot have alarms.")
        .with_context("id", id.to_string())
}
