//! Terminal bridge: one pseudo-terminal-backed process per session.
//!
//! Each session runs two blocking helpers (the PTY reader and the child
//! waiter) plus one async forwarder that turns raw output into `Output`
//! events. The forwarder owns the transition to `Closed`, whether the
//! process exits on its own or is killed by [`TerminalBridge::close`].

use super::prompt::PromptDetector;
use super::pty::{exit_info, pty_size, PtyProcess};
use super::scrollback::Scrollback;
use super::{SessionInfo, SessionState, SessionWriter};
use async_trait::async_trait;
use chrono::Utc;
use portable_pty::{Child, ChildKiller, MasterPty};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use termhub_core::{
    BridgeError, BridgeResult, EventBus, EventDraft, EventPayload, ExitInfo, SessionConfig,
    SessionId, TerminalConfig,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

const SOURCE: &str = "terminal";

/// How often the child waiter checks for exit or a termination request.
const CHILD_POLL: Duration = Duration::from_millis(25);

/// OS resources held while the process may still be alive.
struct LivePty {
    /// Mutex because `MasterPty` is not `Sync`.
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Asks the child waiter to escalate to SIGKILL after the grace period.
    /// Dropping it has the same effect.
    terminate: std_mpsc::Sender<()>,
}

struct SessionEntry {
    info: SessionInfo,
    scrollback: Scrollback,
    /// `None` once the session is closed.
    pty: Option<LivePty>,
    ready: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

struct Shared {
    bus: Arc<EventBus>,
    config: TerminalConfig,
    prompts: PromptDetector,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

/// Owns every session's terminal and process. Cheap to clone.
#[derive(Clone)]
pub struct TerminalBridge {
    shared: Arc<Shared>,
}

impl TerminalBridge {
    pub fn new(bus: Arc<EventBus>, config: TerminalConfig) -> BridgeResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                bus,
                config,
                prompts: PromptDetector::new()?,
                sessions: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Spawn a process on a new terminal and start forwarding its output.
    ///
    /// On `Spawn` errors nothing is registered.
    pub async fn open_session(&self, config: SessionConfig) -> BridgeResult<SessionId> {
        let rows = config.rows.unwrap_or(self.shared.config.default_rows);
        let cols = config.cols.unwrap_or(self.shared.config.default_cols);
        let process = PtyProcess::spawn(&config, rows, cols).inspect_err(|e| {
            warn!(command = ?config.shell_command, error = %e, "session spawn failed");
        })?;
        let PtyProcess {
            master,
            reader,
            writer,
            child,
            killer,
            command,
        } = process;

        let id = SessionId::generate();
        let now = Utc::now();
        let (ready, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        let (terminate, terminate_rx) = std_mpsc::channel();
        let mut entry = SessionEntry {
            info: SessionInfo {
                id: id.clone(),
                command: command.clone(),
                rows,
                cols,
                state: SessionState::Starting,
                created_at: now,
                ready: false,
                exit: None,
                bytes_read: 0,
                bytes_written: 0,
                write_count: 0,
                error_count: 0,
                last_activity: now,
            },
            scrollback: Scrollback::new(self.shared.config.scrollback_bytes),
            pty: Some(LivePty {
                master: std::sync::Mutex::new(master),
                writer: Arc::new(Mutex::new(writer)),
                killer,
                terminate,
            }),
            ready,
            closed,
        };

        {
            let mut sessions = self.shared.sessions.write().await;
            let started = self.shared.publish(
                &id,
                EventPayload::SessionStarted {
                    command: command.clone(),
                    rows,
                    cols,
                },
            );
            if let Err(e) = started {
                if let Some(mut pty) = entry.pty.take() {
                    let _ = pty.killer.kill();
                }
                reap(child);
                return Err(e);
            }
            entry.info.state = SessionState::Running;
            sessions.insert(id.clone(), entry);
        }

        info!(session_id = %id, command = %command, rows, cols, "session opened");
        self.start_io(id.clone(), reader, child, terminate_rx);
        Ok(id)
    }

    fn start_io(
        &self,
        id: SessionId,
        mut reader: Box<dyn Read + Send>,
        child: Box<dyn Child + Send + Sync>,
        terminate: std_mpsc::Receiver<()>,
    ) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(self.shared.config.channel_capacity.max(1));
        let chunk_size = self.shared.config.read_chunk_size.max(1);
        let reader_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone.
                    Err(e) => {
                        debug!(session_id = %reader_id, error = %e, "PTY reader stopped");
                        break;
                    }
                }
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        let grace = self.shared.config.kill_grace();
        let waiter_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let exit = watch_child(&waiter_id, child, terminate, grace);
            let _ = exit_tx.send(exit);
        });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.forward(id, rx, exit_rx).await });
    }

    /// Forward `data` to the process. Calls are applied in the order made.
    pub async fn write(&self, id: &SessionId, data: &[u8]) -> BridgeResult<()> {
        let writer = {
            let sessions = self.shared.sessions.read().await;
            let entry = sessions
                .get(id)
                .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))?;
            match (&entry.pty, entry.info.state) {
                (Some(pty), SessionState::Starting | SessionState::Running) => {
                    Arc::clone(&pty.writer)
                }
                _ => return Err(BridgeError::SessionClosed(id.clone())),
            }
        };

        let mut guard = writer.lock_owned().await;
        let bytes = data.to_vec();
        let len = bytes.len() as u64;
        let result = tokio::task::spawn_blocking(move || {
            guard.write_all(&bytes)?;
            guard.flush()
        })
        .await
        .map_err(|e| BridgeError::Other(format!("write task failed: {e}")))?;

        let mut sessions = self.shared.sessions.write().await;
        if let Some(entry) = sessions.get_mut(id) {
            match &result {
                Ok(()) => {
                    entry.info.bytes_written += len;
                    entry.info.write_count += 1;
                    entry.info.last_activity = Utc::now();
                }
                Err(_) => entry.info.error_count += 1,
            }
        }
        drop(sessions);

        result.map_err(|e| {
            warn!(session_id = %id, error = %e, "PTY write failed");
            BridgeError::Io(e)
        })
    }

    pub async fn resize(&self, id: &SessionId, rows: u16, cols: u16) -> BridgeResult<()> {
        if rows == 0 || cols == 0 {
            return Err(BridgeError::Other(format!(
                "invalid terminal size {rows}x{cols}"
            )));
        }
        let mut sessions = self.shared.sessions.write().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))?;
        let pty = match (&entry.pty, entry.info.state) {
            (Some(pty), SessionState::Starting | SessionState::Running) => pty,
            _ => return Err(BridgeError::SessionClosed(id.clone())),
        };
        let master = pty
            .master
            .lock()
            .map_err(|_| BridgeError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| BridgeError::Other(format!("PTY resize failed: {e}")))?;
        drop(master);

        entry.info.rows = rows;
        entry.info.cols = cols;
        debug!(session_id = %id, rows, cols, "PTY resized");
        Ok(())
    }

    /// Terminate the session's process and release its terminal.
    ///
    /// Closing a closed session is a no-op. If the process does not go away
    /// within `close_timeout_ms` the session is released regardless.
    pub async fn close(&self, id: &SessionId) -> BridgeResult<()> {
        let mut closed_rx = {
            let mut sessions = self.shared.sessions.write().await;
            let entry = sessions
                .get_mut(id)
                .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))?;
            match entry.info.state {
                SessionState::Closed => return Ok(()),
                SessionState::Closing => {}
                SessionState::Starting | SessionState::Running => {
                    entry.info.state = SessionState::Closing;
                    if let Some(pty) = entry.pty.as_mut() {
                        if let Err(e) = pty.killer.kill() {
                            debug!(session_id = %id, error = %e, "SIGHUP failed, process likely gone");
                        }
                        let _ = pty.terminate.send(());
                    }
                    info!(session_id = %id, "closing session");
                }
            }
            entry.closed.subscribe()
        };

        let timeout = self.shared.config.close_timeout();
        let wait = async move {
            let _ = closed_rx.wait_for(|closed| *closed).await;
        };
        let exited = tokio::time::timeout(timeout, wait).await.is_ok();
        if !exited {
            warn!(session_id = %id, "process did not exit in time, releasing session");
            self.shared.finish(id, None).await;
        }
        Ok(())
    }

    /// Wait until the session shows its first interactive prompt.
    ///
    /// Fails with `SessionClosed` if the process goes away first and with
    /// `Timeout` if neither happens within `timeout`.
    pub async fn wait_ready(&self, id: &SessionId, timeout: Duration) -> BridgeResult<()> {
        let (mut ready_rx, mut closed_rx) = {
            let sessions = self.shared.sessions.read().await;
            let entry = sessions
                .get(id)
                .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))?;
            (entry.ready.subscribe(), entry.closed.subscribe())
        };

        let wait = async move {
            tokio::select! {
                biased;
                ready = ready_rx.wait_for(|ready| *ready) => ready.is_ok(),
                _ = closed_rx.wait_for(|closed| *closed) => false,
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BridgeError::SessionClosed(id.clone())),
            Err(_) => {
                debug!(session_id = %id, ?timeout, "session not ready in time");
                Err(BridgeError::Timeout(format!(
                    "session {id} showed no prompt within {timeout:?}"
                )))
            }
        }
    }

    pub async fn session_info(&self, id: &SessionId) -> BridgeResult<SessionInfo> {
        let sessions = self.shared.sessions.read().await;
        sessions
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
    }

    /// All known sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.shared.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Recent output retained for replay.
    pub async fn scrollback(&self, id: &SessionId) -> BridgeResult<Vec<u8>> {
        let sessions = self.shared.sessions.read().await;
        sessions
            .get(id)
            .map(|e| e.scrollback.contents())
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()))
    }

    /// Forget closed sessions. Returns the ids removed.
    pub async fn prune_closed(&self) -> Vec<SessionId> {
        let mut sessions = self.shared.sessions.write().await;
        let mut removed = Vec::new();
        sessions.retain(|id, entry| {
            if entry.info.state == SessionState::Closed {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "pruned closed sessions");
        }
        removed
    }

    /// Close every session that is still open.
    pub async fn shutdown(&self) {
        let open: Vec<SessionId> = {
            let sessions = self.shared.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, e)| e.info.state != SessionState::Closed)
                .map(|(id, _)| id.clone())
                .collect()
        };
        info!(sessions = open.len(), "terminal bridge shutting down");
        for id in open {
            if let Err(e) = self.close(&id).await {
                warn!(session_id = %id, error = %e, "close during shutdown failed");
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionWriter for TerminalBridge {
    async fn write(&self, id: &SessionId, data: &[u8]) -> BridgeResult<()> {
        TerminalBridge::write(self, id, data).await
    }

    async fn is_running(&self, id: &SessionId) -> BridgeResult<bool> {
        let info = self.session_info(id).await?;
        Ok(matches!(
            info.state,
            SessionState::Starting | SessionState::Running
        ))
    }
}

impl Shared {
    fn publish(&self, id: &SessionId, payload: EventPayload) -> BridgeResult<u64> {
        self.bus.publish(EventDraft::new(id.clone(), SOURCE, payload))
    }

    async fn forward(
        self: Arc<Self>,
        id: SessionId,
        mut rx: mpsc::Receiver<Vec<u8>>,
        mut exit_rx: oneshot::Receiver<Option<ExitInfo>>,
    ) {
        // How long output may keep flowing after the process exited.
        let drain = self.config.close_timeout();
        let mut exit: Option<Option<ExitInfo>> = None;
        loop {
            tokio::select! {
                biased;
                chunk = rx.recv() => match chunk {
                    Some(data) => self.on_output(&id, data).await,
                    None => break,
                },
                status = &mut exit_rx, if exit.is_none() => {
                    exit = Some(status.ok().flatten());
                }
                _ = tokio::time::sleep(drain), if exit.is_some() => {
                    debug!(session_id = %id, "terminal still open after exit, stop forwarding");
                    break;
                }
            }
        }

        let exit = match exit {
            Some(exit) => exit,
            None => tokio::time::timeout(drain, exit_rx)
                .await
                .ok()
                .and_then(Result::ok)
                .flatten(),
        };
        self.finish(&id, exit).await;
    }

    async fn on_output(&self, id: &SessionId, data: Vec<u8>) {
        let prompt_detected = self.prompts.is_prompt(&data);
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(id) else {
            return;
        };
        if entry.info.state == SessionState::Closed {
            return;
        }
        entry.info.bytes_read += data.len() as u64;
        entry.info.last_activity = Utc::now();
        entry.scrollback.push(&data);
        if prompt_detected && !entry.info.ready {
            entry.info.ready = true;
            entry.ready.send_replace(true);
            info!(session_id = %id, "session ready");
        }
        // Published under the lock so no Output can follow SessionClosed.
        if let Err(e) = self.publish(
            id,
            EventPayload::Output {
                data,
                prompt_detected,
            },
        ) {
            debug!(session_id = %id, error = %e, "dropping output");
        }
    }

    /// Move the session to `Closed`, release its terminal and announce it.
    /// Runs at most once per session.
    async fn finish(&self, id: &SessionId, exit: Option<ExitInfo>) {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(id) else {
            return;
        };
        if entry.info.state == SessionState::Closed {
            return;
        }
        entry.info.state = SessionState::Closed;
        entry.info.exit = exit;
        let released = entry.pty.take();
        if let Err(e) = self.publish(id, EventPayload::SessionClosed { exit }) {
            debug!(session_id = %id, error = %e, "could not publish session close");
        }
        entry.closed.send_replace(true);
        drop(sessions);
        drop(released);
        info!(
            session_id = %id,
            code = ?exit.map(|e| e.code),
            success = ?exit.map(|e| e.success),
            "session closed"
        );
    }
}

/// Wait for the child to exit.
///
/// Once termination is requested, or the session drops its sender, the
/// child has `grace` to exit after the SIGHUP it was sent before
/// `Child::kill` escalates to SIGKILL.
fn watch_child(
    id: &SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    terminate: std_mpsc::Receiver<()>,
    grace: Duration,
) -> Option<ExitInfo> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(exit_info(&status)),
            Ok(None) => {}
            Err(e) => {
                debug!(session_id = %id, error = %e, "child wait failed");
                return None;
            }
        }
        match terminate.recv_timeout(CHILD_POLL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(exit_info(&status));
        }
        std::thread::sleep(CHILD_POLL);
    }
    warn!(session_id = %id, pid = ?child.process_id(), "process survived SIGHUP, killing");
    if let Err(e) = child.kill() {
        debug!(session_id = %id, error = %e, "kill failed");
    }
    child.wait().ok().map(|status| exit_info(&status))
}

/// Kill and collect an abandoned child so it does not linger as a zombie.
fn reap(mut child: Box<dyn Child + Send + Sync>) {
    tokio::task::spawn_blocking(move || {
        let _ = child.kill();
        let _ = child.wait();
    });
}
