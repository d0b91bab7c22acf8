//! Events published on the bus.
//!
//! An [`Event`] is immutable once stamped by the bus. Callers describe what
//! happened with an [`EventDraft`]; the bus assigns the sequence number and
//! timestamp.

use crate::command::{CommandId, CommandStatus};
use crate::context::ContextState;
use crate::error::BridgeError;
use crate::ids::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Output,
    SessionStarted,
    SessionClosed,
    CommandAccepted,
    CommandRejected,
    CommandCompleted,
    ContextUpdated,
    ContextWarning,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Output,
        EventKind::SessionStarted,
        EventKind::SessionClosed,
        EventKind::CommandAccepted,
        EventKind::CommandRejected,
        EventKind::CommandCompleted,
        EventKind::ContextUpdated,
        EventKind::ContextWarning,
        EventKind::Error,
    ];

    /// Dotted topic name, e.g. `session.output`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Output => "session.output",
            EventKind::SessionStarted => "session.started",
            EventKind::SessionClosed => "session.closed",
            EventKind::CommandAccepted => "command.accepted",
            EventKind::CommandRejected => "command.rejected",
            EventKind::CommandCompleted => "command.completed",
            EventKind::ContextUpdated => "context.updated",
            EventKind::ContextWarning => "context.warning",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| BridgeError::Other(format!("unknown event kind: {s}")))
    }
}

/// How a session's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: u32,
    pub success: bool,
}

/// Non-fatal failures reported through `Error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// A transcript line was not a JSON object.
    Parse { line: u64 },
    /// A subscriber returned an error or panicked.
    HandlerFault { subscription: u64, event_seq: u64 },
    /// I/O failure inside a reader or watcher.
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// Raw process output; chunk boundaries carry no meaning.
    Output { data: Vec<u8>, prompt_detected: bool },
    SessionStarted { command: String, rows: u16, cols: u16 },
    /// `exit` is `None` when the exit status could not be collected.
    SessionClosed { exit: Option<ExitInfo> },
    CommandAccepted { command_id: CommandId, text: String },
    CommandRejected { command_id: CommandId, text: String, reason: String },
    CommandCompleted {
        command_id: CommandId,
        status: CommandStatus,
        duration_ms: Option<i64>,
    },
    ContextUpdated { state: Arc<ContextState> },
    ContextWarning { percentage: f64, token_count: u64, token_limit: u64 },
    Error { error: ErrorKind, message: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Output { .. } => EventKind::Output,
            EventPayload::SessionStarted { .. } => EventKind::SessionStarted,
            EventPayload::SessionClosed { .. } => EventKind::SessionClosed,
            EventPayload::CommandAccepted { .. } => EventKind::CommandAccepted,
            EventPayload::CommandRejected { .. } => EventKind::CommandRejected,
            EventPayload::CommandCompleted { .. } => EventKind::CommandCompleted,
            EventPayload::ContextUpdated { .. } => EventKind::ContextUpdated,
            EventPayload::ContextWarning { .. } => EventKind::ContextWarning,
            EventPayload::Error { .. } => EventKind::Error,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Bus-wide, strictly increasing, never reused.
    pub seq: u64,
    pub session_id: SessionId,
    /// Component that published the event (`terminal`, `commands`, ...).
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Output bytes, if this is an `Output` event.
    pub fn output(&self) -> Option<&[u8]> {
        match &self.payload {
            EventPayload::Output { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// An event before the bus stamps it.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub session_id: SessionId,
    pub source: String,
    pub payload: EventPayload,
}

impl EventDraft {
    pub fn new(session_id: SessionId, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id,
            source: source.into(),
            payload,
        }
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// `None` is the wildcard.
    pub kind: Option<EventKind>,
    pub session: Option<SessionId>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            session: None,
        }
    }

    pub fn for_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.kind.map_or(true, |k| k == event.kind())
            && self.session.as_ref().map_or(true, |s| s == &event.session_id)
    }

    /// Key used in `BusStats::subscriber_counts`.
    pub fn key(&self) -> &'static str {
        self.kind.map_or("*", EventKind::as_str)
    }
}

/// Criteria for `EventBus::history`.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub kind: Option<EventKind>,
    pub source: Option<String>,
    pub session: Option<SessionId>,
    /// Return only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn matches(&self, event: &Event) -> bool {
        self.kind.map_or(true, |k| k == event.kind())
            && self.source.as_ref().map_or(true, |s| s == &event.source)
            && self.session.as_ref().map_or(true, |s| s == &event.session_id)
    }
}
