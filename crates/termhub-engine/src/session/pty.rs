//! Pseudo-terminal allocation and process spawning via portable-pty.

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use std::io::{Read, Write};
use termhub_core::{BridgeError, BridgeResult, ExitInfo, SessionConfig};
use tracing::{debug, info};

/// A freshly spawned process and the master side of its terminal.
///
/// The slave side is dropped once the child holds it, so the reader sees
/// end-of-stream when the process exits.
pub struct PtyProcess {
    pub master: Box<dyn MasterPty + Send>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    /// Command line as launched, for events and listings.
    pub command: String,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Open a terminal of `rows` x `cols` and start the configured program on it.
    pub fn spawn(config: &SessionConfig, rows: u16, cols: u16) -> BridgeResult<Self> {
        let (cmd, command) = build_command(config)?;

        let pair = native_pty_system()
            .openpty(pty_size(rows, cols))
            .map_err(|e| BridgeError::Spawn(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::Spawn(format!("{command}: {e}")))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::Spawn(format!("failed to take PTY writer: {e}")))?;

        info!(command = %command, rows, cols, pid = ?child.process_id(), "PTY spawned");
        Ok(Self {
            master: pair.master,
            reader,
            writer,
            child,
            killer,
            command,
        })
    }
}

/// Translate a session config into the program to launch.
///
/// `shell_command` is split with shell quoting rules; without one the user's
/// `$SHELL` (or `/bin/sh`) is started.
pub fn build_command(config: &SessionConfig) -> BridgeResult<(CommandBuilder, String)> {
    let (mut cmd, command) = match config.shell_command.as_deref() {
        Some(line) => {
            let parts = shell_words::split(line)
                .map_err(|e| BridgeError::Spawn(format!("invalid command line {line:?}: {e}")))?;
            let Some((program, args)) = parts.split_first() else {
                return Err(BridgeError::Spawn("empty command".into()));
            };
            let mut builder = CommandBuilder::new(program);
            builder.args(args);
            (builder, line.to_string())
        }
        None => {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            (CommandBuilder::new(&shell), shell)
        }
    };

    if let Some(dir) = &config.working_directory {
        if !dir.is_dir() {
            return Err(BridgeError::Spawn(format!(
                "working directory {} does not exist",
                dir.display()
            )));
        }
        cmd.cwd(dir);
    }

    // Caller-supplied env wins over the default TERM.
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    debug!(command = %command, "built PTY command");
    Ok((cmd, command))
}

pub fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub fn exit_info(status: &ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.exit_code(),
        success: status.success(),
    }
}
