use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::time::{parse_time_of_day, HourMinute};
use crate::{AppError, AppResult};

/// Stable key naming one weekly habit slot, e.g. `0@08:00`.
pub fn recurrence_key(weekday: u8, time: HourMinute) -> String {
    format!("{weekday}@{:02}:{:02}", time.hour, time.minute)
}

pub fn parse_recurrence_key(key: &str) -> AppResult<(u8, HourMinute)> {
    let invalid = || {
        AppError::new("ALARM/INVALID_RECURRENCE", "Malformed recurrence key.")
            .with_context("key", key.to_string())
    };
    let (day, time) = key.split_once('@').ok_or_else(invalid)?;
    let day: u8 = day.parse().map_err(|_| invalid())?;
    check_weekday(day)?;
    Ok((day, parse_time_of_day(time)?))
}

pub fn check_weekday(weekday: u8) -> AppResult<()> {
    if weekday > 6 {
        return Err(
            AppError::new("ALARM/INVALID_WEEKDAY", "Weekday must be 0 (Monday) to 6 (Sunday).")
                .with_context("weekday", weekday.to_string()),
        );
    }
    Ok(())
}

fn resolve(zone: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    // Inside a DST gap the wall-clock slot does not exist; use the first
    // instant after it.
    zone.from_local_datetime(&local)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|instant| instant.with_timezone(&Utc))
}

/// Next instant strictly after `now` that falls on `weekday` (0 = Monday)
/// at `time` wall-clock in `zone`. A slot already passed today rolls to
/// the same weekday next week.
pub fn next_occurrence(weekday: u8, time: HourMinute, now: DateTime<Utc>, zone: Tz) -> AppResult<DateTime<Utc>> {
    check_weekday(weekday)?;
    let local_now = now.with_timezone(&zone);
    let today = local_now.weekday().num_days_from_monday() as i64;
    let ahead = (i64::from(weekday) - today).rem_euclid(7);

    for extra_weeks in 0..=1 {
        let date = local_now.date_naive() + Duration::days(ahead + 7 * extra_weeks);
        let Some(slot) = date.and_hms_opt(time.hour, time.minute, 0) else {
            break;
        };
        if let Some(instant) = resolve(zone, slot) {
            if instant > now {
                return Ok(instant);
            }
        }
    }
    Err(AppError::new(
        "ALARM/NO_OCCURRENCE",
        "Could not compute the next occurrence for this slot.",
    )
    .with_context("weekday", weekday.to_string())
    .with_context("time", format!("{:02}:{:02}", time.hour, time.minute)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Weekday};
    use proptest::prelude::*;

    fn hm(hour: u32, minute: u32) -> HourMinute {
        HourMinute { hour, minute }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn passed_slot_today_rolls_a_full_week() {
        // 2024-06-03 is a Monday.
        let now = utc(2024, 6, 3, 9, 0);
        let next = next_occurrence(0, hm(8, 0), now, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 6, 10, 8, 0));
    }

    #[test]
    fn later_slot_today_stays_today() {
        let now = utc(2024, 6, 3, 7, 59);
        let next = next_occurrence(0, hm(8, 0), now, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 6, 3, 8, 0));
    }

    #[test]
    fn exact_slot_is_not_strictly_future() {
        let now = utc(2024, 6, 3, 8, 0);
        let next = next_occurrence(0, hm(8, 0), now, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 6, 10, 8, 0));
    }

    #[test]
    fn wall_clock_follows_the_zone() {
        // Monday 2024-06-03 09:00 in Madrid (UTC+2) is 07:00 UTC.
        let now = utc(2024, 6, 3, 7, 0);
        let next = next_occurrence(2, hm(8, 30), now, chrono_tz::Europe::Madrid).unwrap();
        let local = next.with_timezone(&chrono_tz::Europe::Madrid);
        assert_eq!(local.weekday(), Weekday::Wed);
        assert_eq!((local.hour(), local.minute()), (8, 30));
        assert_eq!(next, utc(2024, 6, 5, 6, 30));
    }

    #[test]
    fn dst_gap_moves_past_the_gap() {
        // 2024-03-31 02:30 does not exist in Madrid.
        let now = utc(2024, 3, 30, 12, 0);
        let next = next_occurrence(6, hm(2, 30), now, chrono_tz::Europe::Madrid).unwrap();
        assert_eq!(next, utc(2024, 3, 31, 1, 30));
    }

    #[test]
    fn recurrence_keys_round_trip() {
        let key = recurrence_key(4, hm(7, 5));
        assert_eq!(key, "4@07:05");
        assert_eq!(parse_recurrence_key(&key).unwrap(), (4, hm(7, 5)));
        assert!(parse_recurrence_key("9@07:05").is_err());
        assert!(next_occurrence(7, hm(7, 5), Utc::now(), Tz::UTC).is_err());
    }

    proptest! {
        #[test]
        fn next_occurrence_is_within_a_week_and_on_the_slot(
            secs in 1_600_000_000i64..1_900_000_000i64,
            weekday in 0u8..7,
            hour in 0u32..24,
            minute in 0u32..60,
        ) {
            let now = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            let zone = chrono_tz::Asia::Tokyo;
            let next = next_occurrence(weekday, hm(hour, minute), now, zone).unwrap();
            prop_assert!(next > now);
            prop_assert!(next - now <= Duration::days(7));
            let local = next.with_timezone(&zone);
            prop_assert_eq!(local.weekday().num_days_from_monday(), u32::from(weekday));
            prop_assert_eq!((local.hour(), local.minute()), (hour, minute));
        }
    }
}
