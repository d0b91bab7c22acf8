//! Transcript tailing and context reconciliation.
//!
//! Each attached monitor runs one watch task that polls the transcript,
//! reads only the bytes past its cursor, and feeds complete lines through
//! [`apply_record`]. Readers get `Arc<ContextState>` snapshots that are
//! replaced wholesale, never mutated in place.

use super::record::{apply_record, parse_line};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use termhub_core::config::expand_tilde;
use termhub_core::{
    BridgeError, BridgeResult, ContextConfig, ContextState, ErrorKind, EventBus, EventDraft,
    EventPayload, SessionId,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SOURCE: &str = "context";

/// Largest read issued per poll step.
const READ_CHUNK: usize = 64 * 1024;

/// Handle returned by [`ContextMonitor::attach`].
pub type MonitorHandle = u64;

/// Where a session's transcript lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptSource {
    File(PathBuf),
    /// The most recently modified `*.jsonl` in the directory or one of its
    /// immediate subdirectories, resolved at attach.
    LatestIn(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Idle,
    Watching,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub monitors: usize,
    pub watching: usize,
    pub errored: usize,
    pub sessions_tracked: usize,
    pub records_parsed: u64,
    pub parse_errors: u64,
}

struct Shared {
    bus: Arc<EventBus>,
    config: ContextConfig,
    states: RwLock<HashMap<SessionId, Arc<ContextState>>>,
    snapshots: Mutex<HashMap<SessionId, VecDeque<Arc<ContextState>>>>,
    records_parsed: AtomicU64,
    parse_errors: AtomicU64,
}

struct MonitorEntry {
    session_id: SessionId,
    transcript: PathBuf,
    status: Arc<Mutex<MonitorStatus>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

pub struct ContextMonitor {
    shared: Arc<Shared>,
    next_handle: AtomicU64,
    monitors: Mutex<HashMap<MonitorHandle, MonitorEntry>>,
}

impl ContextMonitor {
    pub fn new(bus: Arc<EventBus>, config: ContextConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                config,
                states: RwLock::new(HashMap::new()),
                snapshots: Mutex::new(HashMap::new()),
                records_parsed: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
            }),
            next_handle: AtomicU64::new(1),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start following `source` for `session`.
    ///
    /// The session's context state starts fresh. A session already being
    /// watched has its previous monitor stopped first.
    pub async fn attach(
        &self,
        session: SessionId,
        source: TranscriptSource,
    ) -> BridgeResult<MonitorHandle> {
        let transcript = match source {
            TranscriptSource::File(path) => expand_tilde(&path),
            TranscriptSource::LatestIn(dir) => latest_transcript(&expand_tilde(&dir)).await?,
        };

        let previous: Vec<MonitorHandle> = self
            .lock_monitors()?
            .iter()
            .filter(|(_, m)| m.session_id == session && m.stop.is_some())
            .map(|(handle, _)| *handle)
            .collect();
        for handle in previous {
            debug!(session_id = %session, handle, "replacing existing monitor");
            self.detach(handle).await?;
        }

        let mut state = ContextState::new(session.clone(), self.shared.config.token_limit);
        state.transcript = Some(transcript.display().to_string());
        self.shared.store(&state, true)?;

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let status = Arc::new(Mutex::new(MonitorStatus::Idle));
        let (stop_tx, stop_rx) = oneshot::channel();
        let tailer = Tailer {
            shared: Arc::clone(&self.shared),
            path: transcript.clone(),
            cursor: 0,
            partial: Vec::new(),
            line_no: 0,
            state,
            warned: false,
        };
        let task = tokio::spawn(tailer.run(stop_rx, Arc::clone(&status)));

        self.lock_monitors()?.insert(
            handle,
            MonitorEntry {
                session_id: session.clone(),
                transcript: transcript.clone(),
                status,
                stop: Some(stop_tx),
                task: Some(task),
            },
        );
        info!(session_id = %session, handle, transcript = %transcript.display(), "monitor attached");
        Ok(handle)
    }

    /// Stop a monitor's watch loop. The session's last state stays queryable.
    /// Detaching a stopped monitor is a no-op.
    pub async fn detach(&self, handle: MonitorHandle) -> BridgeResult<()> {
        let (stop, task) = {
            let mut monitors = self.lock_monitors()?;
            let entry = monitors
                .get_mut(&handle)
                .ok_or(BridgeError::MonitorNotFound(handle))?;
            (entry.stop.take(), entry.task.take())
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(handle, error = %e, "monitor task ended abnormally");
            }
        }
        debug!(handle, "monitor detached");
        Ok(())
    }

    /// Latest snapshot for `session`.
    pub fn get_state(&self, session: &SessionId) -> BridgeResult<Arc<ContextState>> {
        self.shared
            .states
            .read()
            .map_err(|_| poisoned())?
            .get(session)
            .cloned()
            .ok_or_else(|| BridgeError::SessionNotFound(session.clone()))
    }

    /// Past snapshots that differed materially from their predecessor,
    /// oldest first; only the most recent `limit` when given.
    pub fn history(
        &self,
        session: &SessionId,
        limit: Option<usize>,
    ) -> BridgeResult<Vec<Arc<ContextState>>> {
        let snapshots = self.shared.snapshots.lock().map_err(|_| poisoned())?;
        let Some(history) = snapshots.get(session) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |l| history.len().saturating_sub(l));
        Ok(history.iter().skip(skip).cloned().collect())
    }

    pub fn status(&self, handle: MonitorHandle) -> BridgeResult<MonitorStatus> {
        let monitors = self.lock_monitors()?;
        let entry = monitors
            .get(&handle)
            .ok_or(BridgeError::MonitorNotFound(handle))?;
        Ok(current(&entry.status))
    }

    /// Path being followed by `handle`.
    pub fn transcript(&self, handle: MonitorHandle) -> BridgeResult<PathBuf> {
        let monitors = self.lock_monitors()?;
        monitors
            .get(&handle)
            .map(|m| m.transcript.clone())
            .ok_or(BridgeError::MonitorNotFound(handle))
    }

    pub fn stats(&self) -> BridgeResult<MonitorStats> {
        let monitors = self.lock_monitors()?;
        let statuses: Vec<MonitorStatus> = monitors.values().map(|m| current(&m.status)).collect();
        let sessions_tracked = self.shared.states.read().map_err(|_| poisoned())?.len();
        Ok(MonitorStats {
            monitors: monitors.len(),
            watching: statuses
                .iter()
                .filter(|s| **s == MonitorStatus::Watching)
                .count(),
            errored: statuses
                .iter()
                .filter(|s| **s == MonitorStatus::Error)
                .count(),
            sessions_tracked,
            records_parsed: self.shared.records_parsed.load(Ordering::SeqCst),
            parse_errors: self.shared.parse_errors.load(Ordering::SeqCst),
        })
    }

    /// Stop every monitor.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let handles: Vec<MonitorHandle> = self.lock_monitors()?.keys().copied().collect();
        info!(monitors = handles.len(), "context monitor shutting down");
        for handle in handles {
            self.detach(handle).await?;
        }
        Ok(())
    }

    /// Drop monitors whose watch task has ended (detached or failed).
    /// Returns the handles removed.
    pub fn prune_stopped(&self) -> BridgeResult<Vec<MonitorHandle>> {
        let mut monitors = self.lock_monitors()?;
        let mut removed: Vec<MonitorHandle> = monitors
            .iter()
            .filter(|(_, m)| m.task.as_ref().map_or(true, |task| task.is_finished()))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &removed {
            monitors.remove(handle);
        }
        removed.sort_unstable();
        if !removed.is_empty() {
            debug!(count = removed.len(), "pruned stopped monitors");
        }
        Ok(removed)
    }

    /// Stop and remove every monitor of `session` and drop its context state
    /// and snapshot history. Afterwards `get_state` reports `SessionNotFound`.
    /// Returns whether anything was known about the session.
    pub async fn forget_session(&self, session: &SessionId) -> BridgeResult<bool> {
        let handles: Vec<MonitorHandle> = self
            .lock_monitors()?
            .iter()
            .filter(|(_, m)| &m.session_id == session)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            self.detach(*handle).await?;
        }
        {
            let mut monitors = self.lock_monitors()?;
            for handle in &handles {
                monitors.remove(handle);
            }
        }
        let had_state = self
            .shared
            .states
            .write()
            .map_err(|_| poisoned())?
            .remove(session)
            .is_some();
        self.shared
            .snapshots
            .lock()
            .map_err(|_| poisoned())?
            .remove(session);
        debug!(session_id = %session, monitors = handles.len(), "context forgotten");
        Ok(had_state || !handles.is_empty())
    }

    fn lock_monitors(
        &self,
    ) -> BridgeResult<std::sync::MutexGuard<'_, HashMap<MonitorHandle, MonitorEntry>>> {
        self.monitors.lock().map_err(|_| poisoned())
    }
}

fn poisoned() -> BridgeError {
    BridgeError::Other("context monitor state poisoned".into())
}

fn current(status: &Mutex<MonitorStatus>) -> MonitorStatus {
    status.lock().map(|s| *s).unwrap_or(MonitorStatus::Error)
}

fn set_status(status: &Mutex<MonitorStatus>, next: MonitorStatus) {
    if let Ok(mut s) = status.lock() {
        *s = next;
    }
}

impl Shared {
    /// Publish-visible snapshot replacement. `reset` drops snapshot history.
    fn store(&self, state: &ContextState, reset: bool) -> BridgeResult<Arc<ContextState>> {
        let snapshot = Arc::new(state.clone());
        self.states
            .write()
            .map_err(|_| poisoned())?
            .insert(state.session_id.clone(), Arc::clone(&snapshot));

        let mut snapshots = self.snapshots.lock().map_err(|_| poisoned())?;
        let history = snapshots.entry(state.session_id.clone()).or_default();
        if reset {
            history.clear();
        }
        let changed = history
            .back()
            .map_or(true, |last| last.has_changed_from(&snapshot));
        if changed && self.config.snapshot_history > 0 {
            history.push_back(Arc::clone(&snapshot));
            while history.len() > self.config.snapshot_history {
                history.pop_front();
            }
        }
        Ok(snapshot)
    }

    fn publish(&self, session: &SessionId, payload: EventPayload) {
        if let Err(e) = self
            .bus
            .publish(EventDraft::new(session.clone(), SOURCE, payload))
        {
            debug!(session_id = %session, error = %e, "context event not published");
        }
    }
}

/// Per-monitor read position and working state.
struct Tailer {
    shared: Arc<Shared>,
    path: PathBuf,
    /// Bytes of the file consumed so far, partial line included.
    cursor: u64,
    /// Trailing bytes not yet terminated by a newline.
    partial: Vec<u8>,
    line_no: u64,
    state: ContextState,
    /// Whether the warning threshold has been crossed and not yet left.
    warned: bool,
}

impl Tailer {
    async fn run(mut self, mut stop: oneshot::Receiver<()>, status: Arc<Mutex<MonitorStatus>>) {
        set_status(&status, MonitorStatus::Watching);
        let session = self.state.session_id.clone();
        let mut ticker = tokio::time::interval(self.shared.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    set_status(&status, MonitorStatus::Stopped);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!(session_id = %session, path = %self.path.display(), error = %e, "transcript read failed");
                        set_status(&status, MonitorStatus::Error);
                        self.shared.publish(
                            &session,
                            EventPayload::Error {
                                error: ErrorKind::Io,
                                message: format!("{}: {e}", self.path.display()),
                            },
                        );
                        break;
                    }
                }
            }
        }
        debug!(session_id = %session, "monitor task finished");
    }

    /// Consume whatever was appended since the last poll.
    async fn poll(&mut self) -> std::io::Result<()> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_dir() => {
                return Err(std::io::Error::other("transcript path is a directory"))
            }
            Ok(meta) => meta.len(),
            // Not written yet: same as empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if len < self.cursor {
            info!(
                session_id = %self.state.session_id,
                cursor = self.cursor,
                len,
                "transcript truncated, restarting from offset 0"
            );
            self.reset();
        }
        if len == self.cursor {
            return Ok(());
        }

        let Some(mut file) = open_at(&self.path, self.cursor).await? else {
            return Ok(());
        };
        let mut remaining = len - self.cursor;
        let mut buf = vec![0u8; READ_CHUNK];
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            self.cursor += n as u64;
            let scanned = self.partial.len();
            self.partial.extend_from_slice(&buf[..n]);
            self.drain_lines(scanned);
        }
        Ok(())
    }

    /// Hand every complete line in `partial` to `handle_line`, keeping the
    /// unterminated tail. Bytes before `scanned` are known to hold no newline.
    fn drain_lines(&mut self, scanned: usize) {
        let pending = std::mem::take(&mut self.partial);
        let mut start = 0;
        let mut search_from = scanned;
        while let Some(offset) = pending[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            self.line_no += 1;
            self.handle_line(&pending[start..end]);
            start = end + 1;
            search_from = start;
        }
        self.partial = pending;
        self.partial.drain(..start);
    }

    fn reset(&mut self) {
        let mut fresh = ContextState::new(self.state.session_id.clone(), self.state.token_limit);
        fresh.transcript = self.state.transcript.take();
        self.state = fresh;
        self.cursor = 0;
        self.partial.clear();
        self.line_no = 0;
        self.warned = false;
        if let Err(e) = self.shared.store(&self.state, true) {
            warn!(error = %e, "could not reset context state");
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let session = self.state.session_id.clone();

        let record = match parse_line(line) {
            Ok(record) => record,
            Err(message) => {
                self.state.parse_errors += 1;
                self.shared.parse_errors.fetch_add(1, Ordering::SeqCst);
                warn!(session_id = %session, line = self.line_no, error = %message, "skipping malformed transcript record");
                if let Err(e) = self.shared.store(&self.state, false) {
                    warn!(error = %e, "could not store context state");
                }
                self.shared.publish(
                    &session,
                    EventPayload::Error {
                        error: ErrorKind::Parse { line: self.line_no },
                        message,
                    },
                );
                return;
            }
        };

        apply_record(&mut self.state, &record, self.shared.config.default_file_tokens);
        self.state.calculate_percentage();
        self.shared.records_parsed.fetch_add(1, Ordering::SeqCst);

        let snapshot = match self.shared.store(&self.state, false) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "could not store context state");
                return;
            }
        };
        let percentage = snapshot.percentage;
        self.shared
            .publish(&session, EventPayload::ContextUpdated { state: snapshot });

        let threshold = self.shared.config.warning_threshold;
        if percentage >= threshold && !self.warned {
            self.warned = true;
            warn!(session_id = %session, percentage, threshold, "context nearing its limit");
            self.shared.publish(
                &session,
                EventPayload::ContextWarning {
                    percentage,
                    token_count: self.state.token_count,
                    token_limit: self.state.token_limit,
                },
            );
        } else if percentage < threshold {
            self.warned = false;
        }
    }
}

/// Open `path` positioned at `offset`. A file that vanished between the
/// size check and the open reads as empty.
async fn open_at(path: &Path, offset: u64) -> std::io::Result<Option<tokio::fs::File>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(Some(file))
}

/// Newest `*.jsonl` file in `dir` or its immediate subdirectories.
pub async fn latest_transcript(dir: &Path) -> BridgeResult<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    let mut dirs = vec![(dir.to_path_buf(), true)];

    while let Some((current, descend)) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if !descend => {
                debug!(dir = %current.display(), error = %e, "skipping unreadable directory");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                if descend {
                    dirs.push((path, false));
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let modified = meta.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
    }

    newest.map(|(_, path)| path).ok_or_else(|| {
        BridgeError::Other(format!("no transcript (*.jsonl) found under {}", dir.display()))
    })
}
