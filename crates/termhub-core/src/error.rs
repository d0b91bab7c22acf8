use crate::command::{CommandId, CommandStatus};
use crate::ids::SessionId;
use thiserror::Error;

/// Errors returned by termhub operations.
///
/// Policy rejections, malformed transcript records and subscriber faults are
/// not represented here: they are reported on the event bus instead.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("command not found: {0}")]
    CommandNotFound(CommandId),

    #[error("command {id} is {status}, cannot {action}")]
    InvalidState {
        id: CommandId,
        status: CommandStatus,
        action: &'static str,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("monitor not found: {0}")]
    MonitorNotFound(u64),

    #[error("event bus is shut down")]
    BusClosed,

    /// The subscription table lock was poisoned. Treated as fatal.
    #[error("event bus state corrupted: {0}")]
    BusPoisoned(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Whether this error means shared state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::BusPoisoned(_))
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        BridgeError::Config(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let id = SessionId::from("abc");
        assert_eq!(
            BridgeError::SessionNotFound(id.clone()).to_string(),
            "session not found: abc"
        );
        assert_eq!(BridgeError::SessionClosed(id).to_string(), "session closed: abc");
        let err = BridgeError::InvalidState {
            id: CommandId(7),
            status: CommandStatus::Completed,
            action: "cancel",
        };
        assert_eq!(err.to_string(), "command 7 is completed, cannot cancel");
    }

    #[test]
    fn test_only_poisoning_is_fatal() {
        assert!(BridgeError::BusPoisoned("lock".into()).is_fatal());
        assert!(!BridgeError::BusClosed.is_fatal());
        assert!(!BridgeError::Spawn("nope".into()).is_fatal());
    }
}
