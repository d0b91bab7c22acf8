//! Commands issued into a live session and their lifecycle.

use crate::error::{BridgeError, BridgeResult};
use crate::ids::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Process-unique command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Failed,
}

impl CommandStatus {
    /// Rejected, completed and failed commands never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Rejected | CommandStatus::Completed | CommandStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Accepted => "accepted",
            CommandStatus::Rejected => "rejected",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    fn can_become(self, next: CommandStatus) -> bool {
        matches!(
            (self, next),
            (CommandStatus::Pending, CommandStatus::Accepted)
                | (CommandStatus::Pending, CommandStatus::Rejected)
                | (CommandStatus::Accepted, CommandStatus::Completed)
                | (CommandStatus::Accepted, CommandStatus::Failed)
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristically detected consequence of running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    FileCreated,
    FileDeleted,
    ContextCompacted,
    ContextCleared,
    MemoryUpdated,
}

/// A single instruction destined for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub session_id: SessionId,
    /// Text as forwarded (after preprocessing, without the trailing newline).
    pub text: String,
    /// Who issued the command (`"user"`, `"api"`, ...).
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub submitted_at: DateTime<Utc>,
    pub status: CommandStatus,
    /// Why the command was rejected or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
}

impl Command {
    pub fn new(
        id: CommandId,
        session_id: SessionId,
        text: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id,
            session_id,
            text: text.into(),
            source: source.into(),
            metadata: BTreeMap::new(),
            submitted_at: Utc::now(),
            status: CommandStatus::Pending,
            reason: None,
            accepted_at: None,
            finished_at: None,
            side_effects: Vec::new(),
        }
    }

    /// Move to `next`, enforcing the legal lifecycle:
    /// `Pending -> {Accepted, Rejected}` and `Accepted -> {Completed, Failed}`.
    pub fn transition(&mut self, next: CommandStatus, reason: Option<String>) -> BridgeResult<()> {
        if !self.status.can_become(next) {
            return Err(BridgeError::InvalidState {
                id: self.id,
                status: self.status,
                action: match next {
                    CommandStatus::Pending => "return to pending",
                    CommandStatus::Accepted => "accept",
                    CommandStatus::Rejected => "reject",
                    CommandStatus::Completed => "complete",
                    CommandStatus::Failed => "fail",
                },
            });
        }
        let now = Utc::now();
        match next {
            CommandStatus::Accepted => self.accepted_at = Some(now),
            _ => self.finished_at = Some(now),
        }
        self.status = next;
        if reason.is_some() {
            self.reason = reason;
        }
        Ok(())
    }

    /// Time between acceptance and completion, once both happened.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.accepted_at?)
    }
}

/// Criteria for `CommandManager::history_filtered`.
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub source: Option<String>,
    pub status: Option<CommandStatus>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl CommandFilter {
    pub fn matches(&self, cmd: &Command) -> bool {
        if let Some(source) = &self.source {
            if &cmd.source != source {
                return false;
            }
        }
        if let Some(status) = self.status {
            if cmd.status != status {
                return false;
            }
        }
        if let Some(after) = self.after {
            if cmd.submitted_at < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if cmd.submitted_at > before {
                return false;
            }
        }
        true
    }
}
