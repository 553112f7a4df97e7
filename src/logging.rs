use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::AppError;

pub const LOG_ENV: &str = "DOSEKEEPER_LOG";
pub const DEFAULT_FILTER: &str = "dosekeeper=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "dosekeeper.log";

fn env_filter() -> EnvFilter {
    EnvFilter::new(std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()))
}

/// JSON logs to stderr. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .try_init();
}

/// JSON logs to stderr plus a daily-rolled file under `dir`.
/// Keep the returned guard alive for as long as file output is wanted.
pub fn init_with_file(dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let _ = tracing_log::LogTracer::init();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(writer)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    info!(target: "dosekeeper", event = "log_file_ready", dir = %dir.display());
    Ok(guard)
}

/// Stable, non-reversible handle for an email address so logs never carry the address itself.
pub fn email_fingerprint(email: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(email.trim().to_lowercase().as_bytes()));
    digest[..12].to_string()
}

fn context_to_json(context: &HashMap<String, String>) -> Option<Value> {
    if context.is_empty() {
        None
    } else {
        let mut map = Map::with_capacity(context.len());
        for (key, value) in context {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Some(Value::Object(map))
    }
}

fn is_expected_failure(code: &str) -> bool {
    code.starts_with("AUTH/") || code.starts_with("OFFLINE/") || code.starts_with("RECORD/")
}

fn wrap_details(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "value": value })
    }
}

/// Times one engine operation and logs its outcome under a single `op` name.
pub struct LogScope {
    op: &'static str,
    owner: Option<String>,
    start: Instant,
}

impl LogScope {
    pub fn new(op: &'static str, owner: Option<&str>) -> Self {
        let scope = Self {
            op,
            owner: owner.map(str::to_owned),
            start: Instant::now(),
        };
        let details = json!({ "stage": "enter" });
        debug!(
            target: "dosekeeper",
            op = scope.op,
            owner = scope.owner.as_deref(),
            details = %details
        );
        scope
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn success(&self, details: Value) {
        let details = wrap_details(details);
        info!(
            target: "dosekeeper",
            op = self.op,
            owner = self.owner.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %details
        );
    }

    pub fn warn(&self, details: Value) {
        let details = wrap_details(details);
        warn!(
            target: "dosekeeper",
            op = self.op,
            owner = self.owner.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %details
        );
    }

    pub fn fail(&self, err: &AppError) {
        let mut map = Map::new();
        map.insert("code".into(), Value::String(err.code().to_string()));
        map.insert("message".into(), Value::String(err.message().to_string()));
        if let Some(context) = context_to_json(err.context()) {
            map.insert("context".into(), context);
        }

        // Validation and credential failures are user mistakes, not faults.
        if is_expected_failure(err.code()) {
            self.warn(Value::Object(map));
            return;
        }

        let details = Value::Object(map);
        error!(
            target: "dosekeeper",
            op = self.op,
            owner = self.owner.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %details
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn details_of(line: &Value) -> &str {
        line["fields"]["details"].as_str().unwrap_or_default()
    }

    #[test]
    fn failures_log_at_a_level_matching_their_code() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            LogScope::new("archive_item", Some("user-1")).fail(
                &AppError::new("STORAGE/WRITE_FAILED", "Write refused.").with_context("key", "queue::items"),
            );
            LogScope::new("sign_in", None).fail(&AppError::new("AUTH/INVALID_EMAIL", "Enter a valid email."));
            LogScope::new("process_queue", None).success(json!({ "succeeded": 2 }));
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        let fault = lines
            .iter()
            .find(|line| line["level"] == "ERROR")
            .expect("storage failure logged as an error");
        assert_eq!(fault["fields"]["op"], "archive_item");
        assert!(details_of(fault).contains("STORAGE/WRITE_FAILED"));
        assert!(details_of(fault).contains("queue::items"));

        assert!(lines
            .iter()
            .any(|line| line["level"] == "WARN" && details_of(line).contains("AUTH/INVALID_EMAIL")));
        assert!(lines
            .iter()
            .any(|line| line["level"] == "INFO" && details_of(line).contains("\"succeeded\":2")));
        assert_eq!(
            lines
                .iter()
                .filter(|line| line["level"] == "DEBUG" && details_of(line).contains("enter"))
                .count(),
            3
        );
    }

    #[test]
    fn fingerprint_is_stable_and_case_insensitive() {
        let a = email_fingerprint("Ana@Example.com ");
        let b = email_fingerprint("ana@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(!a.contains('@'));
        assert_ne!(a, email_fingerprint("other@example.com"));
    }

    #[test]
    fn scalar_details_are_wrapped() {
        assert_eq!(wrap_details(json!(3)), json!({ "value": 3 }));
        assert_eq!(wrap_details(json!({ "a": 1 })), json!({ "a": 1 }));
    }
}
