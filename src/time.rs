use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{AppError, AppResult};

pub const MINUTE_MS: i64 = 60_000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_date(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Source of "now" for everything that computes trigger times or stamps records.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        to_date(self.now_ms())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_ms()
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self::new(instant.timestamp_millis())
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A wall-clock `HH:MM` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HourMinute {
    pub hour: u32,
    pub minute: u32,
}

impl HourMinute {
    pub fn total_minutes(&self) -> i64 {
        i64::from(self.hour) * 60 + i64::from(self.minute)
    }
}

/// Parses `H:MM` / `HH:MM`. Minutes must be two digits.
pub fn parse_hhmm(raw: &str) -> AppResult<HourMinute> {
    let invalid = || {
        AppError::new("TIME/INVALID_HHMM", "Expected a time in HH:MM format.")
            .with_context("value", raw.to_string())
    };
    let (h, m) = raw.trim().split_once(':').ok_or_else(invalid)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(invalid());
    }
    if !h.chars().all(|c| c.is_ascii_digit()) || !m.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if minute > 59 {
        return Err(invalid());
    }
    Ok(HourMinute { hour, minute })
}

/// Interprets an `HH:MM` field as a duration (medication dosing interval).
/// Hours are not capped at 23 here: `36:00` is a valid interval.
pub fn interval_ms(raw: &str) -> AppResult<i64> {
    let hm = parse_hhmm(raw)?;
    Ok(hm.total_minutes() * MINUTE_MS)
}

/// Same as [`parse_hhmm`] but rejects hours outside a day.
pub fn parse_time_of_day(raw: &str) -> AppResult<HourMinute> {
    let hm = parse_hhmm(raw)?;
    if hm.hour > 23 {
        return Err(
            AppError::new("TIME/INVALID_HHMM", "Hour must be between 00 and 23.")
                .with_context("value", raw.to_string()),
        );
    }
    Ok(hm)
}
