//! Session management: PTY lifecycle, output forwarding, scrollback.

pub mod bridge;
pub mod prompt;
pub mod pty;
pub mod scrollback;

pub use bridge::TerminalBridge;
pub use prompt::PromptDetector;
pub use pty::PtyProcess;
pub use scrollback::Scrollback;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use termhub_core::{BridgeResult, ExitInfo, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub command: String,
    pub rows: u16,
    pub cols: u16,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// Set once the first interactive prompt was seen.
    pub ready: bool,
    pub exit: Option<ExitInfo>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub write_count: u64,
    pub error_count: u64,
    pub last_activity: DateTime<Utc>,
}

/// The slice of the bridge the command manager needs.
#[async_trait]
pub trait SessionWriter: Send + Sync + 'static {
    /// Forward bytes to the session's process.
    async fn write(&self, id: &SessionId, data: &[u8]) -> BridgeResult<()>;

    /// `Ok(false)` for a known but no longer running session.
    async fn is_running(&self, id: &SessionId) -> BridgeResult<bool>;
}
