use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{AppError, AppResult};

pub const ENV_SNOOZE_THRESHOLD: &str = "DOSEKEEPER_SNOOZE_THRESHOLD";
pub const ENV_REMOTE_TIMEOUT_MS: &str = "DOSEKEEPER_REMOTE_TIMEOUT_MS";
pub const ENV_TIMEZONE: &str = "DOSEKEEPER_TIMEZONE";

const CONFIG_INVALID: &str = "CONFIG/INVALID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Snooze count at or above which a non-compliance event is emitted.
    pub snooze_notify_threshold: u32,
    /// How long past its trigger time an alarm survives maintenance.
    pub expired_alarm_grace_ms: i64,
    /// Deadline applied to every remote call; elapsing counts as offline.
    pub remote_timeout_ms: u64,
    pub temp_owner_prefix: String,
    pub temp_record_prefix: String,
    /// IANA zone used for habit wall-clock times. `None` means the system zone.
    pub timezone: Option<String>,
    pub default_snooze_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snooze_notify_threshold: 3,
            expired_alarm_grace_ms: 60 * 60 * 1000,
            remote_timeout_ms: 10_000,
            temp_owner_prefix: "temp_".to_string(),
            temp_record_prefix: "local_".to_string(),
            timezone: None,
            default_snooze_minutes: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(
            target: "dosekeeper",
            event = "config_loaded",
            path = %path.display()
        );
        Ok(config)
    }

    pub fn with_env_overrides(self) -> AppResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SNOOZE_THRESHOLD) {
            self.snooze_notify_threshold = parse_env(ENV_SNOOZE_THRESHOLD, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REMOTE_TIMEOUT_MS) {
            self.remote_timeout_ms = parse_env(ENV_REMOTE_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TIMEZONE) {
            self.timezone = Some(raw.trim().to_string());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.snooze_notify_threshold == 0 {
            return Err(AppError::new(
                CONFIG_INVALID,
                "snoozeNotifyThreshold must be at least 1.",
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(AppError::new(
                CONFIG_INVALID,
                "remoteTimeoutMs must be positive.",
            ));
        }
        if self.expired_alarm_grace_ms < 0 {
            return Err(AppError::new(
                CONFIG_INVALID,
                "expiredAlarmGraceMs cannot be negative.",
            ));
        }
        if self.temp_owner_prefix.is_empty() || self.temp_record_prefix.is_empty() {
            return Err(AppError::new(
                CONFIG_INVALID,
                "Temporary id prefixes cannot be empty.",
            ));
        }
        if let Some(zone) = &self.timezone {
            Tz::from_str(zone).map_err(|_| {
                AppError::new(CONFIG_INVALID, "Unknown timezone.").with_context("timezone", zone)
            })?;
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Resolves the configured zone, then the system zone, then UTC.
    pub fn resolve_timezone(&self) -> Tz {
        if let Some(zone) = self.timezone.as_deref() {
            if let Ok(tz) = Tz::from_str(zone) {
                return tz;
            }
        }
        match iana_time_zone::get_timezone() {
            Ok(name) => Tz::from_str(&name).unwrap_or_else(|_| {
                warn!(
                    target: "dosekeeper",
                    event = "timezone_unrecognised",
                    zone = %name
                );
                Tz::UTC
            }),
            Err(_) => Tz::UTC,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> AppResult<T> {
    raw.trim().parse::<T>().map_err(|_| {
        AppError::new(CONFIG_INVALID, "Environment override is not a valid number.")
            .with_context("key", key)
            .with_context("value", raw)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.snooze_notify_threshold, 3);
        assert_eq!(config.expired_alarm_grace_ms, 3_600_000);
        assert_eq!(config.remote_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "snoozeNotifyThreshold": 5, "timezone": "Europe/Dublin" }"#)
                .unwrap();
        assert_eq!(config.snooze_notify_threshold, 5);
        assert_eq!(config.temp_owner_prefix, "temp_");
        assert_eq!(config.resolve_timezone(), chrono_tz::Europe::Dublin);
    }

    #[test]
    fn overrides_apply_and_validate() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SNOOZE_THRESHOLD, "4"),
            (ENV_TIMEZONE, "America/Mexico_City"),
        ]);
        let config = EngineConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.snooze_notify_threshold, 4);
        assert_eq!(config.timezone.as_deref(), Some("America/Mexico_City"));

        let err = EngineConfig::default()
            .with_overrides(|key| (key == ENV_REMOTE_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), CONFIG_INVALID);

        let err = EngineConfig::default()
            .with_overrides(|key| (key == ENV_TIMEZONE).then(|| "Mars/Olympus".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), CONFIG_INVALID);
    }
}
