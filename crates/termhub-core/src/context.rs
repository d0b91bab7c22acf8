//! Conversation context derived from a session transcript.

use crate::ids::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file the wrapped tool pulled into its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    /// Estimated token cost.
    pub tokens: u64,
    pub loaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Reconciled view of every transcript record parsed so far.
///
/// Published as an `Arc<ContextState>` snapshot and replaced wholesale on
/// each update, so holders of a snapshot never see it change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextState {
    pub session_id: SessionId,
    /// Transcript path being followed, if resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    pub token_count: u64,
    pub token_limit: u64,
    pub percentage: f64,
    pub files_loaded: Vec<FileInfo>,
    pub last_compact: Option<DateTime<Utc>>,
    pub session_start: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub messages_count: u64,
    pub last_role: Option<String>,
    pub last_record_kind: Option<String>,
    pub records_parsed: u64,
    pub parse_errors: u64,
}

impl ContextState {
    pub fn new(session_id: SessionId, token_limit: u64) -> Self {
        Self {
            session_id,
            transcript: None,
            token_count: 0,
            token_limit,
            percentage: 0.0,
            files_loaded: Vec::new(),
            last_compact: None,
            session_start: Utc::now(),
            last_updated: None,
            messages_count: 0,
            last_role: None,
            last_record_kind: None,
            records_parsed: 0,
            parse_errors: 0,
        }
    }

    /// Recompute `percentage` from the token counters. A zero limit yields 0.
    pub fn calculate_percentage(&mut self) {
        self.percentage = if self.token_limit == 0 {
            0.0
        } else {
            (self.token_count as f64 / self.token_limit as f64) * 100.0
        };
    }

    /// Sum of the estimated token cost of every loaded file.
    pub fn file_tokens(&self) -> u64 {
        self.files_loaded.iter().map(|f| f.tokens).sum()
    }

    /// Whether `other` differs in a way worth keeping in snapshot history.
    pub fn has_changed_from(&self, other: &ContextState) -> bool {
        self.token_count != other.token_count
            || self.messages_count != other.messages_count
            || self.files_loaded.len() != other.files_loaded.len()
            || self.last_compact != other.last_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = ContextState::new(SessionId::from("s"), 200_000);
        assert_eq!(state.token_count, 0);
        assert_eq!(state.token_limit, 200_000);
        assert_eq!(state.percentage, 0.0);
        assert!(state.files_loaded.is_empty());
        assert!(state.last_compact.is_none());
        assert_eq!(state.messages_count, 0);
    }

    #[test]
    fn test_calculate_percentage() {
        let mut state = ContextState::new(SessionId::from("s"), 200_000);
        state.token_count = 50_000;
        state.calculate_percentage();
        assert_eq!(state.percentage, 25.0);

        state.token_count = 200_000;
        state.calculate_percentage();
        assert_eq!(state.percentage, 100.0);

        state.token_limit = 0;
        state.calculate_percentage();
        assert_eq!(state.percentage, 0.0);
    }

    #[test]
    fn test_change_detection() {
        let a = ContextState::new(SessionId::from("s"), 100);
        let mut b = a.clone();
        assert!(!a.has_changed_from(&b));

        b.token_count = 10;
        assert!(a.has_changed_from(&b));

        b.token_count = 0;
        b.files_loaded.push(FileInfo {
            path: "/test.py".into(),
            tokens: 100,
            loaded_at: Utc::now(),
            size_bytes: None,
        });
        assert!(a.has_changed_from(&b));
        assert_eq!(b.file_tokens(), 100);

        let mut c = a.clone();
        c.last_compact = Some(Utc::now());
        assert!(a.has_changed_from(&c));
    }
}
