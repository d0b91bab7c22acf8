//! termhub-engine: the runtime half of the terminal bridge.
//!
//! Provides PTY-backed sessions ([`TerminalBridge`]), command validation and
//! per-session sequencing ([`CommandManager`]), and transcript-driven context
//! tracking ([`ContextMonitor`]). Every component reports through a shared
//! [`termhub_core::EventBus`].

pub mod commands;
pub mod context;
pub mod session;

// Re-export commonly used items at crate root.
pub use commands::{CommandManager, CommandPreprocessor, CommandRequest, CommandValidator, Verdict};
pub use context::{ContextMonitor, MonitorHandle, MonitorStatus, TranscriptSource};
pub use session::{SessionInfo, SessionState, SessionWriter, TerminalBridge};
