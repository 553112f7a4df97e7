use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, AppResult};

/// Scoping key for every per-user collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_temporary(&self, prefix: &str) -> bool {
        crate::id::is_temp_id(&self.0, prefix)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Medications,
    Habits,
    Appointments,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Medications,
        Collection::Habits,
        Collection::Appointments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Medications => "medications",
            Collection::Habits => "habits",
            Collection::Appointments => "appointments",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }

    /// Alarm-bearing item type, if records of this collection carry alarms.
    pub fn item_type(&self) -> Option<ItemType> {
        match self {
            Collection::Medications => Some(ItemType::Med),
            Collection::Habits => Some(ItemType::Habit),
            Collection::Appointments => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Med,
    Habit,
}

impl ItemType {
    pub fn collection(&self) -> Collection {
        match self {
            ItemType::Med => Collection::Medications,
            ItemType::Habit => Collection::Habits,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Med => "med",
            ItemType::Habit => "habit",
        }
    }
}

fn bool_or_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

fn i64_or_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Document-shaped snapshot of one record. Everything beyond the bookkeeping
/// fields lives in `extra`, which is only interpreted through the typed views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
    pub id: String,
    #[serde(default, deserialize_with = "bool_or_null")]
    pub is_archived: bool,
    #[serde(default)]
    pub archived_at: Option<i64>,
    #[serde(default, deserialize_with = "i64_or_null")]
    pub updated_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_archived: false,
            archived_at: None,
            updated_at: 0,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Archived for alarm purposes: the flag or a recorded archival time.
    pub fn is_archived_for_alarms(&self) -> bool {
        self.is_archived || self.archived_at.is_some()
    }

    /// Builds a record from a remote document body plus its id.
    pub fn from_document(id: &str, mut body: Map<String, Value>) -> AppResult<Self> {
        body.insert("id".into(), Value::String(id.to_string()));
        Ok(serde_json::from_value(Value::Object(body))?)
    }

    /// Remote document body: every field except `id`.
    pub fn to_document(&self) -> AppResult<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(mut map) => {
                map.remove("id");
                Ok(map)
            }
            _ => Err(AppError::new(
                "RECORD/ENCODE",
                "Record did not serialize to an object.",
            )),
        }
    }

    /// Shallow-merges `patch` into this record. `id` is never patched.
    pub fn merge(&mut self, patch: &RecordPatch) -> AppResult<()> {
        let mut doc = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch.fields() {
            if key == "id" {
                continue;
            }
            doc.insert(key.clone(), value.clone());
        }
        *self = serde_json::from_value(Value::Object(doc))?;
        Ok(())
    }

    /// Replaces every string value equal to `from` (outside `id`) with `to`.
    pub fn replace_references(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for value in self.extra.values_mut() {
            changed |= replace_in_value(value, from, to);
        }
        changed
    }
}

fn replace_in_value(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, item| replace_in_value(item, from, to) || acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, item| replace_in_value(item, from, to) || acc),
        _ => false,
    }
}

/// Partial field update. Only built from typed patches or internal state
/// transitions; `Value::Null` clears a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPatch(Map<String, Value>);

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_typed<T: Serialize>(patch: &T) -> AppResult<Self> {
        match serde_json::to_value(patch)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(AppError::new(
                "RECORD/INVALID_PATCH",
                "Patch must serialize to an object.",
            )),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn clear(self, key: &str) -> Self {
        self.set(key, Value::Null)
    }

    pub fn extend(&mut self, other: RecordPatch) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn replace_references(&mut self, from: &str, to: &str) -> bool {
        self.0
            .values_mut()
            .fold(false, |acc, value| replace_in_value(value, from, to) || acc)
    }
}

/// Records of one (collection, owner), ordered, unique by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CachedCollection {
    records: Vec<CachedRecord>,
}

impl CachedCollection {
    /// Later duplicates replace earlier ones in place.
    pub fn from_records(records: Vec<CachedRecord>) -> Self {
        let mut collection = Self::default();
        for record in records {
            collection.upsert(record);
        }
        collection
    }

    pub fn records(&self) -> &[CachedRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CachedRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CachedRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CachedRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Wholesale replace when the id exists, append otherwise.
    pub fn upsert(&mut self, record: CachedRecord) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<CachedRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    pub fn active(&self) -> Vec<CachedRecord> {
        self.records.iter().filter(|r| !r.is_archived).cloned().collect()
    }

    pub fn archived(&self) -> Vec<CachedRecord> {
        self.records.iter().filter(|r| r.is_archived).cloned().collect()
    }

    /// Merges `other` on top of this collection (other wins on id clashes).
    pub fn absorb(&mut self, other: CachedCollection) {
        for record in other.records {
            self.upsert(record);
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CachedRecord> {
        self.records.iter_mut()
    }
}

/// Typed view over a [`CachedRecord`] of a fixed collection.
pub trait TypedRecord: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn from_record(record: &CachedRecord) -> AppResult<Self> {
        let value = serde_json::to_value(record)?;
        serde_json::from_value(value).map_err(|err| {
            AppError::from(err)
                .with_context("collection", Self::COLLECTION.as_str())
                .with_context("id", record.id.clone())
        })
    }

    fn to_record(&self) -> AppResult<CachedRecord> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Medication {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_label: Option<String>,
    /// Dosing interval, `HH:MM` read as a duration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_on_hand: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_per_dose: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    pub next_due_at: Option<i64>,
    pub last_taken_at: Option<i64>,
    pub current_alarm_id: Option<String>,
    pub snooze_count: u32,
    pub snoozed_until: Option<i64>,
    pub last_snooze_at: Option<i64>,
    pub is_archived: bool,
    pub archived_at: Option<i64>,
    pub updated_at: i64,
}

impl TypedRecord for Medication {
    const COLLECTION: Collection = Collection::Medications;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Habit {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Weekdays, 0 = Monday .. 6 = Sunday.
    pub days: Vec<u8>,
    /// Wall-clock `HH:MM` slots.
    pub times: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    pub scheduled_alarm_ids: Vec<String>,
    pub current_alarm_id: Option<String>,
    pub snooze_count: u32,
    pub snoozed_until: Option<i64>,
    pub last_snooze_at: Option<i64>,
    pub last_completed_at: Option<i64>,
    pub is_archived: bool,
    pub archived_at: Option<i64>,
    pub updated_at: i64,
}

impl TypedRecord for Habit {
    const COLLECTION: Collection = Collection::Habits;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Appointment {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Calendar date, `YYYY-MM-DD`.
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub is_archived: bool,
    pub archived_at: Option<i64>,
    pub updated_at: i64,
}

impl TypedRecord for Appointment {
    const COLLECTION: Collection = Collection::Appointments;
}

/// User-editable medication fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_on_hand: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_per_dose: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub times: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Alarm bookkeeping written on every alarm transition.
/// `Some(None)` clears a field; `None` leaves it as is.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmStatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_alarm_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snooze_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snooze_at: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_taken_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dismissed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_on_hand: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_alarm_ids: Option<Vec<String>>,
    pub updated_at: i64,
}

impl AlarmStatePatch {
    pub fn at(now: i64) -> Self {
        Self {
            updated_at: now,
            ..Self::default()
        }
    }

    /// Clears the live alarm pointer and all snooze bookkeeping.
    pub fn reset_snooze(mut self) -> Self {
        self.current_alarm_id = Some(None);
        self.snooze_count = Some(0);
        self.snoozed_until = Some(None);
        self.last_snooze_at = Some(None);
        self
    }
}
