//! Task events: the append-only audit trail and the replay source for
//! progress subscribers.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Created,
    Start,
    StepStart,
    StepLog,
    StepDone,
    Error,
    Complete,
    Cancelled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Start => "start",
            EventKind::StepStart => "step-start",
            EventKind::StepLog => "step-log",
            EventKind::StepDone => "step-done",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
            EventKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event fields supplied by the emitter; the `TaskManager` fills in the
/// task id, sequence number and timestamp when it appends the event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub kind: EventKind,
    pub step: String,
    pub message: String,
    pub host: Option<String>,
    pub progress: Option<f64>,
    pub data: Option<serde_json::Value>,
}

impl EventDraft {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: String::new(),
            message: message.into(),
            host: None,
            progress: None,
            data: None,
        }
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One immutable entry in a task's event log.
///
/// Events are totally ordered within a task by `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub seq: u64,
    pub kind: EventKind,
    pub step: String,
    pub message: String,
    pub host: Option<String>,
    pub progress: Option<f64>,
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Timestamps are kept at millisecond precision so they survive the wire
    /// format unchanged.
    pub fn from_draft(task_id: TaskId, seq: u64, draft: EventDraft, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            seq,
            kind: draft.kind,
            step: draft.step,
            message: draft.message,
            host: draft.host,
            progress: draft.progress,
            data: draft.data,
            timestamp: truncate_to_millis(now),
        }
    }

    pub fn to_payload(&self) -> EventPayload {
        EventPayload {
            op_id: self.task_id,
            kind: self.kind,
            step: self.step.clone(),
            message: self.message.clone(),
            host: self.host.clone(),
            progress: self.progress,
            data: self.data.clone(),
            timestamp_ms: self.timestamp.timestamp_millis(),
        }
    }

    /// Rebuild an event from its wire form. `seq` is transport framing and is
    /// supplied by the receiver.
    pub fn from_payload(payload: EventPayload, seq: u64) -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(payload.timestamp_ms)
            .single()
            .unwrap_or_default();
        Self {
            task_id: payload.op_id,
            seq,
            kind: payload.kind,
            step: payload.step,
            message: payload.message,
            host: payload.host,
            progress: payload.progress,
            data: payload.data,
            timestamp,
        }
    }
}

/// Transport-agnostic JSON shape of an event (SSE, websocket, long-poll).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub op_id: TaskId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub step: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp_ms: i64,
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}
