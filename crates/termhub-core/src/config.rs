//! Configuration: TOML file sections plus per-session options.

use crate::error::BridgeResult;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub commands: CommandPolicy,
    #[serde(default)]
    pub context: ContextConfig,
}

/// `[bus]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

/// `[terminal]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Upper bound on the size of one `Output` event.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Capacity of the reader -> publisher queue.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// How long `close` lets the process handle SIGHUP before SIGKILL.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl TerminalConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_rows: default_rows(),
            default_cols: default_cols(),
            read_chunk_size: default_read_chunk_size(),
            channel_capacity: default_channel_capacity(),
            scrollback_bytes: default_scrollback_bytes(),
            close_timeout_ms: default_close_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// `[commands]` section: what `CommandManager::submit` accepts.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandPolicy {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Regexes checked in addition to the built-in forbidden patterns.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub require_session_running: bool,
    /// Forward commands without waiting for the previous one to complete.
    #[serde(default)]
    pub allow_pipelining: bool,
    /// Terminate each forwarded command with `\n`.
    #[serde(default = "default_true")]
    pub append_newline: bool,
    /// Per-session history cap; 0 keeps everything.
    #[serde(default)]
    pub history_limit: usize,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            blocked_patterns: Vec::new(),
            require_session_running: true,
            allow_pipelining: false,
            append_newline: true,
            history_limit: 0,
        }
    }
}

/// `[context]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,
    /// Percentage at which a `ContextWarning` is published.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Token estimate for each file the tool reads.
    #[serde(default = "default_file_tokens")]
    pub default_file_tokens: u64,
    #[serde(default = "default_snapshot_history")]
    pub snapshot_history: usize,
}

impl ContextConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            token_limit: default_token_limit(),
            warning_threshold: default_warning_threshold(),
            default_file_tokens: default_file_tokens(),
            snapshot_history: default_snapshot_history(),
        }
    }
}

fn default_history_limit() -> usize {
    1000
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_read_chunk_size() -> usize {
    8192
}
fn default_channel_capacity() -> usize {
    64
}
fn default_scrollback_bytes() -> usize {
    256 * 1024
}
fn default_close_timeout_ms() -> u64 {
    2000
}
fn default_kill_grace_ms() -> u64 {
    500
}
fn default_max_length() -> usize {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_token_limit() -> u64 {
    200_000
}
fn default_warning_threshold() -> f64 {
    90.0
}
fn default_file_tokens() -> u64 {
    1000
}
fn default_snapshot_history() -> usize {
    100
}
fn default_true() -> bool {
    true
}

impl BridgeConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> BridgeResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let expanded = expand_tilde(path);
        if !expanded.exists() {
            info!(path = %expanded.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded)?;
        Self::from_toml_str(&content)
    }
}

/// Options for opening one session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Command line to run; the user's shell when absent.
    #[serde(default)]
    pub shell_command: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Falls back to `[terminal] default_rows` when absent.
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl SessionConfig {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            shell_command: Some(command.into()),
            ..Default::default()
        }
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
