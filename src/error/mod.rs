use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

use crate::remote::RemoteError;

/// Error surfaced to callers of the engine. Codes are `AREA/REASON`
/// (`AUTH/`, `OFFLINE/`, `RECORD/`, `ALARM/`, `REMOTE/`, `STORAGE/`, ...);
/// the message is safe to show to the user as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    /// Identifiers of the record, alarm or path involved. Never credentials.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {}

/// Remote failures keep their code; the raw remote text moves to `detail`.
impl From<RemoteError> for AppError {
    fn from(error: RemoteError) -> Self {
        AppError::new(error.code(), error.user_message()).with_context("detail", error.to_string())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let mut app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

/// Stored documents that no longer parse; the position helps find the bad key.
impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else {
            "JSON/IO"
        };

        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::PoolTimedOut => AppError::new(
                "STORAGE/POOL_TIMEOUT",
                "Timed out waiting for the local database.",
            ),
            SqlxError::PoolClosed => AppError::new("STORAGE/POOL_CLOSED", "The local database is closed."),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlite"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("STORAGE/SQLITE_{code}"))
                    .unwrap_or_else(|| "STORAGE/DATABASE".to_string());
                AppError::new(code, db.message().to_string())
            }
            other => AppError::new("STORAGE/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_shows_up_in_display() {
        let error = AppError::new("RECORD/NOT_FOUND", "The item no longer exists.")
            .with_context("collection", "medications")
            .with_context("id", "med-1");

        assert_eq!(error.code(), "RECORD/NOT_FOUND");
        assert_eq!(error.context().get("id"), Some(&"med-1".to_string()));
        let shown = error.to_string();
        assert!(shown.starts_with("[RECORD/NOT_FOUND] The item no longer exists."));
        assert!(shown.contains("medications"));
    }

    #[test]
    fn remote_errors_keep_their_code_and_hide_raw_text() {
        let error = AppError::from(RemoteError::EmailInUse);
        assert_eq!(error.code(), "REMOTE/EMAIL_IN_USE");
        assert_eq!(error.message(), "This email is already registered.");

        let error = AppError::from(RemoteError::Internal("upstream 503".into()));
        assert_eq!(error.code(), "REMOTE/INTERNAL");
        assert!(!error.message().contains("503"));
        assert!(error.context()["detail"].contains("upstream 503"));

        assert_eq!(AppError::from(RemoteError::WeakPassword).code(), "AUTH/WEAK_PASSWORD");
    }

    #[test]
    fn unreadable_stored_json_reports_its_position() {
        let err: SerdeJsonError =
            serde_json::from_str::<serde_json::Value>("{\"queue\": }").expect_err("invalid json");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert_eq!(app_error.context().get("line").map(String::as_str), Some("1"));
        assert!(app_error.context().contains_key("column"));
    }

    #[test]
    fn io_errors_carry_their_kind() {
        let err = IoError::new(std::io::ErrorKind::PermissionDenied, "read-only volume");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "IO/PermissionDenied");
        assert_eq!(app_error.message(), "read-only volume");
    }

    #[test]
    fn closed_pool_maps_to_a_store_code() {
        assert_eq!(AppError::from(SqlxError::PoolClosed).code(), "STORAGE/POOL_CLOSED");
    }

    #[test]
    fn serializes_as_a_flat_struct() {
        let error = AppError::new("AUTH/INVALID_EMAIL", "Enter a valid email address.")
            .with_context("field", "email");
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(value["code"], "AUTH/INVALID_EMAIL");
        assert_eq!(value["context"]["field"], "email");
        assert!(AppError::new("OFFLINE/NO_CACHED_CREDENTIALS", "x")
            .context()
            .is_empty());
        assert!(serde_json::to_value(AppError::new("A/B", "c"))
            .expect("serialize")
            .get("context")
            .is_none());
    }
}
