use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::model::{ItemType, OwnerId};
use crate::{AppError, AppResult};

/// Adherence signal produced by alarm transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComplianceEvent {
    Completed {
        owner: OwnerId,
        item_type: ItemType,
        item_id: String,
        alarm_id: String,
        snoozes_before: u32,
        at: i64,
    },
    Snoozed {
        owner: OwnerId,
        item_type: ItemType,
        item_id: String,
        alarm_id: String,
        snooze_count: u32,
        until: i64,
    },
    NonCompliance {
        owner: OwnerId,
        item_type: ItemType,
        item_id: String,
        snooze_count: u32,
        threshold: u32,
        at: i64,
    },
    Dismissed {
        owner: OwnerId,
        item_type: ItemType,
        item_id: String,
        alarm_id: String,
        at: i64,
    },
}

impl ComplianceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ComplianceEvent::Completed { .. } => "completed",
            ComplianceEvent::Snoozed { .. } => "snoozed",
            ComplianceEvent::NonCompliance { .. } => "non_compliance",
            ComplianceEvent::Dismissed { .. } => "dismissed",
        }
    }
}

/// Best-effort receiver of compliance events. Errors are logged by the
/// emitter and never reach the alarm action.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ComplianceEvent) -> AppResult<()>;
}

/// Writes events to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ComplianceEvent) -> AppResult<()> {
        info!(
            target: "dosekeeper",
            event = "compliance_event",
            kind = event.kind(),
            details = %serde_json::to_value(&event)?
        );
        Ok(())
    }
}

/// Forwards events over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ComplianceEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ComplianceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ComplianceEvent) -> AppResult<()> {
        self.tx.send(event).map_err(|_| {
            AppError::new("ALARM/EVENT_SINK_CLOSED", "Compliance event receiver was dropped.")
        })
    }
}

/// Keeps every event in memory.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ComplianceEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ComplianceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|event| event.kind() == kind).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ComplianceEvent) -> AppResult<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dismissed() -> ComplianceEvent {
        ComplianceEvent::Dismissed {
            owner: OwnerId::new("u1"),
            item_type: ItemType::Habit,
            item_id: "h1".into(),
            alarm_id: "a1".into(),
            at: 5,
        }
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let value = serde_json::to_value(dismissed()).unwrap();
        assert_eq!(value["kind"], "dismissed");
        assert_eq!(value["item_type"], "habit");
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.emit(dismissed()).unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "dismissed");
        drop(rx);
        assert_eq!(
            sink.emit(dismissed()).unwrap_err().code(),
            "ALARM/EVENT_SINK_CLOSED"
        );
    }
}
