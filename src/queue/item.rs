use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Collection, OwnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    InFlight,
    /// Last attempt failed transiently; still retried.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::InFlight => "IN_FLIGHT",
            QueueStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub operation: Operation,
    pub collection: Collection,
    pub item_id: String,
    #[serde(rename = "ownerIdentity")]
    pub owner: OwnerId,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub enqueued_at: i64,
    pub status: QueueStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn is_replayable(&self) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Failed)
    }
}

/// Outcome of one queue pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed,
    SkippedAlreadyRunning,
    SkippedOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub attempted: usize,
    pub succeeded: usize,
    /// Permanently rejected items removed from the queue.
    pub dropped: usize,
    /// Items left queued because their owner hit a transient failure.
    pub deferred: usize,
    pub remaining: usize,
    /// Temporary record ids replaced by remote ones.
    pub remapped: usize,
}

impl SyncReport {
    pub fn skipped(outcome: SyncOutcome, remaining: usize) -> Self {
        Self {
            outcome,
            attempted: 0,
            succeeded: 0,
            dropped: 0,
            deferred: 0,
            remaining,
            remapped: 0,
        }
    }

    pub fn ran(&self) -> bool {
        self.outcome == SyncOutcome::Completed
    }
}
