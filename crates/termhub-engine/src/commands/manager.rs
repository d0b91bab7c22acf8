//! Command sequencing into live sessions.
//!
//! Every session has a lane: an async mutex held from the moment a command
//! is recorded until its bytes have been written. That makes history order,
//! acceptance order and write order identical for one session.

use super::policy::{detect_side_effects, CommandPreprocessor, CommandValidator, Verdict};
use crate::session::SessionWriter;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use termhub_core::{
    BridgeError, BridgeResult, Command, CommandFilter, CommandId, CommandPolicy, CommandStatus,
    EventBus, EventDraft, EventPayload, SessionId,
};
use tracing::{debug, info, warn};

const SOURCE: &str = "commands";
const FORGOTTEN: &str = "session forgotten";

/// What a caller asks to run.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub text: String,
    pub source: String,
    pub metadata: BTreeMap<String, String>,
}

impl CommandRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: "user".into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandStats {
    pub total_commands: usize,
    /// Accepted and not yet completed.
    pub in_flight: usize,
    /// Pending behind an in-flight command.
    pub queued: usize,
    pub status_counts: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Lane {
    in_flight: Vec<CommandId>,
    queue: VecDeque<CommandId>,
}

type SharedLane = Arc<tokio::sync::Mutex<Lane>>;

#[derive(Default)]
struct Book {
    commands: HashMap<CommandId, Command>,
    /// Per-session ids in insertion order.
    histories: HashMap<SessionId, Vec<CommandId>>,
}

pub struct CommandManager {
    bus: Arc<EventBus>,
    sessions: Arc<dyn SessionWriter>,
    policy: CommandPolicy,
    validator: CommandValidator,
    preprocessors: RwLock<Vec<Arc<dyn CommandPreprocessor>>>,
    next_id: AtomicU64,
    book: Mutex<Book>,
    lanes: Mutex<HashMap<SessionId, SharedLane>>,
    finished: tokio::sync::Notify,
}

impl CommandManager {
    pub fn new(
        bus: Arc<EventBus>,
        sessions: Arc<dyn SessionWriter>,
        policy: CommandPolicy,
    ) -> BridgeResult<Self> {
        let validator = CommandValidator::new(&policy)?;
        Ok(Self {
            bus,
            sessions,
            policy,
            validator,
            preprocessors: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            book: Mutex::new(Book::default()),
            lanes: Mutex::new(HashMap::new()),
            finished: tokio::sync::Notify::new(),
        })
    }

    pub fn register_preprocessor(&self, preprocessor: Arc<dyn CommandPreprocessor>) {
        match self.preprocessors.write() {
            Ok(mut list) => list.push(preprocessor),
            Err(_) => warn!("preprocessor list poisoned, registration dropped"),
        }
    }

    /// Submit `text` on behalf of `"user"`.
    pub async fn submit(&self, session: &SessionId, text: &str) -> BridgeResult<CommandId> {
        self.submit_request(session, CommandRequest::new(text)).await
    }

    /// Validate, record and (unless held back) forward a command.
    ///
    /// A policy violation is not an `Err`: the command is recorded as
    /// `Rejected` and a `CommandRejected` event is published. `Err` means the
    /// accepted command could not be written.
    pub async fn submit_request(
        &self,
        session: &SessionId,
        request: CommandRequest,
    ) -> BridgeResult<CommandId> {
        let lane = self.lane(session)?;
        let mut lane = lane.lock().await;

        let CommandRequest {
            text,
            source,
            metadata,
        } = request;
        let (text, preprocess_error) = match self.preprocess(text.clone()).await {
            Ok(processed) => (processed, None),
            Err(e) => (text, Some(format!("preprocessor failed: {e:#}"))),
        };

        let id = CommandId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut cmd = Command::new(id, session.clone(), text, source);
        cmd.metadata = metadata;
        cmd.side_effects = detect_side_effects(&cmd.text);
        let verdict = match preprocess_error {
            Some(reason) => Verdict::Reject(reason),
            None => self.validator.check(&cmd.text),
        };
        self.record(cmd)?;

        let verdict = match verdict {
            Verdict::Allow => self.session_available(session).await,
            rejected => rejected,
        };
        if let Verdict::Reject(reason) = verdict {
            self.reject(id, reason)?;
            return Ok(id);
        }

        if !self.policy.allow_pipelining && !lane.in_flight.is_empty() {
            lane.queue.push_back(id);
            debug!(session_id = %session, command_id = %id, queued = lane.queue.len(), "command queued");
            return Ok(id);
        }
        self.forward(&mut lane, id).await?;
        Ok(id)
    }

    /// Submit several commands in order, stopping after the first rejection.
    /// Returns the ids processed, the rejected one included.
    pub async fn submit_batch(
        &self,
        session: &SessionId,
        texts: &[&str],
    ) -> BridgeResult<Vec<CommandId>> {
        let mut ids = Vec::with_capacity(texts.len());
        for text in texts {
            let id = self.submit(session, text).await?;
            ids.push(id);
            if self.status(id)? == CommandStatus::Rejected {
                break;
            }
        }
        Ok(ids)
    }

    /// Record the outcome of an accepted command and release the next queued
    /// one, if any.
    pub async fn mark_completed(&self, id: CommandId, success: bool) -> BridgeResult<()> {
        let session = self.get(id)?.session_id;
        let lane = self.lane(&session)?;
        let mut lane = lane.lock().await;

        let status = self.status(id)?;
        if status != CommandStatus::Accepted {
            return Err(BridgeError::InvalidState {
                id,
                status,
                action: "complete",
            });
        }
        let outcome = if success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        self.finish(&mut lane, id, outcome, None)?;
        self.pump(&mut lane, &session).await;
        Ok(())
    }

    /// Cancel a pending or accepted command.
    ///
    /// Pending commands become `Rejected`, accepted ones `Failed`, both with
    /// reason `"cancelled"`.
    pub async fn cancel(&self, id: CommandId) -> BridgeResult<()> {
        let session = self.get(id)?.session_id;
        let lane = self.lane(&session)?;
        let mut lane = lane.lock().await;

        match self.status(id)? {
            CommandStatus::Pending => {
                lane.queue.retain(|queued| *queued != id);
                self.reject(id, "cancelled".into())?;
            }
            CommandStatus::Accepted => {
                self.finish(&mut lane, id, CommandStatus::Failed, Some("cancelled".into()))?;
                self.pump(&mut lane, &session).await;
            }
            status => {
                return Err(BridgeError::InvalidState {
                    id,
                    status,
                    action: "cancel",
                })
            }
        }
        info!(command_id = %id, "command cancelled");
        Ok(())
    }

    /// Drop the session's lane and command history, typically once the
    /// session is closed. Queued commands are rejected and in-flight ones
    /// failed first, both with reason "session forgotten". Returns how many
    /// commands were dropped.
    pub async fn forget_session(&self, session: &SessionId) -> BridgeResult<usize> {
        let lane = self.lanes()?.get(session).cloned();
        if let Some(lane) = lane {
            let mut lane = lane.lock().await;
            while let Some(id) = lane.queue.pop_front() {
                self.reject(id, FORGOTTEN.into())?;
            }
            for id in std::mem::take(&mut lane.in_flight) {
                self.finish(&mut lane, id, CommandStatus::Failed, Some(FORGOTTEN.into()))?;
            }
            self.lanes()?.remove(session);
        }

        let mut book = self.book()?;
        let ids = book.histories.remove(session).unwrap_or_default();
        for id in &ids {
            book.commands.remove(id);
        }
        info!(session_id = %session, commands = ids.len(), "session commands forgotten");
        Ok(ids.len())
    }

    /// The session's commands in submission order. Unknown sessions have an
    /// empty history.
    pub fn history(&self, session: &SessionId) -> BridgeResult<Vec<Command>> {
        self.history_filtered(session, &CommandFilter::default())
    }

    pub fn history_filtered(
        &self,
        session: &SessionId,
        filter: &CommandFilter,
    ) -> BridgeResult<Vec<Command>> {
        let book = self.book()?;
        let mut matched: Vec<Command> = book
            .histories
            .get(session)
            .into_iter()
            .flatten()
            .filter_map(|id| book.commands.get(id))
            .filter(|cmd| filter.matches(cmd))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        Ok(matched)
    }

    pub fn get(&self, id: CommandId) -> BridgeResult<Command> {
        self.book()?
            .commands
            .get(&id)
            .cloned()
            .ok_or(BridgeError::CommandNotFound(id))
    }

    pub fn status(&self, id: CommandId) -> BridgeResult<CommandStatus> {
        self.book()?
            .commands
            .get(&id)
            .map(|c| c.status)
            .ok_or(BridgeError::CommandNotFound(id))
    }

    /// Wait until the command reaches a terminal status, or `timeout`
    /// elapses. Returns the status at that point.
    pub async fn wait_for_completion(
        &self,
        id: CommandId,
        timeout: Duration,
    ) -> BridgeResult<CommandStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.status(id)?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.status(id);
            }
        }
    }

    pub fn stats(&self) -> BridgeResult<CommandStats> {
        let book = self.book()?;
        let mut status_counts = BTreeMap::new();
        let mut in_flight = 0;
        let mut queued = 0;
        for cmd in book.commands.values() {
            *status_counts
                .entry(cmd.status.as_str().to_string())
                .or_insert(0) += 1;
            match cmd.status {
                CommandStatus::Accepted => in_flight += 1,
                CommandStatus::Pending => queued += 1,
                _ => {}
            }
        }
        Ok(CommandStats {
            total_commands: book.commands.len(),
            in_flight,
            queued,
            status_counts,
        })
    }

    fn book(&self) -> BridgeResult<MutexGuard<'_, Book>> {
        self.book
            .lock()
            .map_err(|_| BridgeError::Other("command table poisoned".into()))
    }

    fn lanes(&self) -> BridgeResult<MutexGuard<'_, HashMap<SessionId, SharedLane>>> {
        self.lanes
            .lock()
            .map_err(|_| BridgeError::Other("command lanes poisoned".into()))
    }

    fn lane(&self, session: &SessionId) -> BridgeResult<SharedLane> {
        Ok(Arc::clone(self.lanes()?.entry(session.clone()).or_default()))
    }

    async fn preprocess(&self, mut text: String) -> anyhow::Result<String> {
        let chain: Vec<Arc<dyn CommandPreprocessor>> = match self.preprocessors.read() {
            Ok(list) => list.clone(),
            Err(_) => anyhow::bail!("preprocessor list poisoned"),
        };
        for preprocessor in chain {
            text = preprocessor.process(text).await?;
        }
        Ok(text)
    }

    async fn session_available(&self, session: &SessionId) -> Verdict {
        if !self.policy.require_session_running {
            return Verdict::Allow;
        }
        match self.sessions.is_running(session).await {
            Ok(true) => Verdict::Allow,
            Ok(false) => Verdict::Reject("session not running".into()),
            Err(BridgeError::SessionNotFound(_)) => Verdict::Reject("session not found".into()),
            Err(e) => Verdict::Reject(e.to_string()),
        }
    }

    fn record(&self, cmd: Command) -> BridgeResult<()> {
        let mut book = self.book()?;
        book.histories
            .entry(cmd.session_id.clone())
            .or_default()
            .push(cmd.id);
        book.commands.insert(cmd.id, cmd);
        Ok(())
    }

    fn reject(&self, id: CommandId, reason: String) -> BridgeResult<()> {
        let (session, text) = {
            let mut book = self.book()?;
            let cmd = book
                .commands
                .get_mut(&id)
                .ok_or(BridgeError::CommandNotFound(id))?;
            cmd.transition(CommandStatus::Rejected, Some(reason.clone()))?;
            let found = (cmd.session_id.clone(), cmd.text.clone());
            self.trim_history(&mut book, &found.0);
            found
        };
        info!(session_id = %session, command_id = %id, reason = %reason, "command rejected");
        self.publish(
            &session,
            EventPayload::CommandRejected {
                command_id: id,
                text,
                reason,
            },
        );
        self.finished.notify_waiters();
        Ok(())
    }

    /// Accept `id` and write it to its session. The caller holds the lane.
    async fn forward(&self, lane: &mut Lane, id: CommandId) -> BridgeResult<()> {
        let (session, text) = {
            let mut book = self.book()?;
            let cmd = book
                .commands
                .get_mut(&id)
                .ok_or(BridgeError::CommandNotFound(id))?;
            cmd.transition(CommandStatus::Accepted, None)?;
            (cmd.session_id.clone(), cmd.text.clone())
        };
        lane.in_flight.push(id);
        info!(session_id = %session, command_id = %id, "command accepted");
        self.publish(
            &session,
            EventPayload::CommandAccepted {
                command_id: id,
                text: text.clone(),
            },
        );

        let mut bytes = text.into_bytes();
        if self.policy.append_newline {
            bytes.push(b'\n');
        }
        if let Err(e) = self.sessions.write(&session, &bytes).await {
            warn!(session_id = %session, command_id = %id, error = %e, "command write failed");
            self.finish(lane, id, CommandStatus::Failed, Some(e.to_string()))?;
            return Err(e);
        }
        Ok(())
    }

    fn finish(
        &self,
        lane: &mut Lane,
        id: CommandId,
        status: CommandStatus,
        reason: Option<String>,
    ) -> BridgeResult<()> {
        let (session, duration_ms) = {
            let mut book = self.book()?;
            let cmd = book
                .commands
                .get_mut(&id)
                .ok_or(BridgeError::CommandNotFound(id))?;
            cmd.transition(status, reason)?;
            let found = (
                cmd.session_id.clone(),
                cmd.duration().map(|d| d.num_milliseconds()),
            );
            self.trim_history(&mut book, &found.0);
            found
        };
        lane.in_flight.retain(|running| *running != id);
        debug!(session_id = %session, command_id = %id, status = %status, "command finished");
        self.publish(
            &session,
            EventPayload::CommandCompleted {
                command_id: id,
                status,
                duration_ms,
            },
        );
        self.finished.notify_waiters();
        Ok(())
    }

    /// Forward queued commands while nothing is in flight.
    async fn pump(&self, lane: &mut Lane, session: &SessionId) {
        while lane.in_flight.is_empty() {
            let Some(next) = lane.queue.pop_front() else {
                break;
            };
            let result = match self.session_available(session).await {
                Verdict::Allow => self.forward(lane, next).await,
                Verdict::Reject(reason) => self.reject(next, reason),
            };
            if let Err(e) = result {
                debug!(session_id = %session, command_id = %next, error = %e, "queued command not forwarded");
            }
        }
    }

    /// Drop the oldest finished commands beyond `history_limit`.
    fn trim_history(&self, book: &mut Book, session: &SessionId) {
        let limit = self.policy.history_limit;
        if limit == 0 {
            return;
        }
        let Book {
            commands,
            histories,
        } = book;
        let Some(history) = histories.get_mut(session) else {
            return;
        };
        while history.len() > limit {
            let Some(pos) = history.iter().position(|id| {
                commands
                    .get(id)
                    .map_or(true, |cmd| cmd.status.is_terminal())
            }) else {
                break;
            };
            let evicted = history.remove(pos);
            commands.remove(&evicted);
        }
    }

    fn publish(&self, session: &SessionId, payload: EventPayload) {
        if let Err(e) = self
            .bus
            .publish(EventDraft::new(session.clone(), SOURCE, payload))
        {
            debug!(session_id = %session, error = %e, "command event not published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use termhub_core::{EventFilter, EventKind};

    #[derive(Default)]
    struct FakeSessions {
        writes: Mutex<Vec<(SessionId, String)>>,
        stopped: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FakeSessions {
        fn written(&self) -> Vec<String> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SessionWriter for FakeSessions {
        async fn write(&self, id: &SessionId, data: &[u8]) -> BridgeResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BridgeError::SessionClosed(id.clone()));
            }
            self.writes
                .lock()
                .unwrap()
                .push((id.clone(), String::from_utf8_lossy(data).into_owned()));
            Ok(())
        }

        async fn is_running(&self, id: &SessionId) -> BridgeResult<bool> {
            if id.as_str() == "ghost" {
                return Err(BridgeError::SessionNotFound(id.clone()));
            }
            Ok(!self.stopped.load(Ordering::SeqCst))
        }
    }

    struct Prefix(&'static str);

    #[async_trait]
    impl CommandPreprocessor for Prefix {
        async fn process(&self, text: String) -> anyhow::Result<String> {
            Ok(format!("{}{text}", self.0))
        }
    }

    struct Refuse;

    #[async_trait]
    impl CommandPreprocessor for Refuse {
        async fn process(&self, _text: String) -> anyhow::Result<String> {
            anyhow::bail!("not today")
        }
    }

    fn setup(policy: CommandPolicy) -> (Arc<EventBus>, Arc<FakeSessions>, CommandManager) {
        let bus = Arc::new(EventBus::new(1000));
        let sessions = Arc::new(FakeSessions::default());
        let manager = CommandManager::new(
            Arc::clone(&bus),
            Arc::clone(&sessions) as Arc<dyn SessionWriter>,
            policy,
        )
        .unwrap();
        (bus, sessions, manager)
    }

    fn pipelined() -> CommandPolicy {
        CommandPolicy {
            allow_pipelining: true,
            ..Default::default()
        }
    }

    fn session() -> SessionId {
        SessionId::from("s1")
    }

    #[tokio::test]
    async fn test_submit_accepts_and_writes() {
        let (bus, sessions, manager) = setup(CommandPolicy::default());
        let (_, mut rx) = bus
            .subscribe_channel(EventFilter::kind(EventKind::CommandAccepted))
            .unwrap();

        let id = manager.submit(&session(), "echo test").await.unwrap();
        assert_eq!(manager.status(id).unwrap(), CommandStatus::Accepted);
        assert_eq!(sessions.written(), vec!["echo test\n"]);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            &event.payload,
            EventPayload::CommandAccepted { command_id, text } if *command_id == id && text == "echo test"
        ));
        assert_eq!(event.source, "commands");
    }

    #[tokio::test]
    async fn test_overlong_command_rejected_without_write() {
        let policy = CommandPolicy {
            max_length: 8,
            ..Default::default()
        };
        let (bus, sessions, manager) = setup(policy);
        let (_, mut rx) = bus
            .subscribe_channel(EventFilter::kind(EventKind::CommandRejected))
            .unwrap();

        let id = manager.submit(&session(), "echo far too long").await.unwrap();
        let cmd = manager.get(id).unwrap();
        assert_eq!(cmd.status, CommandStatus::Rejected);
        assert!(cmd.reason.unwrap().contains("max length"));
        assert!(sessions.written().is_empty());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.payload, EventPayload::CommandRejected { command_id, .. } if command_id == id));
        assert_eq!(manager.history(&session()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_or_unknown_session_rejected() {
        let (_bus, sessions, manager) = setup(CommandPolicy::default());
        let ghost = manager.submit(&SessionId::from("ghost"), "ls").await.unwrap();
        assert_eq!(
            manager.get(ghost).unwrap().reason.as_deref(),
            Some("session not found")
        );

        sessions.stopped.store(true, Ordering::SeqCst);
        let id = manager.submit(&session(), "ls").await.unwrap();
        assert_eq!(manager.status(id).unwrap(), CommandStatus::Rejected);

        let lenient = CommandPolicy {
            require_session_running: false,
            ..Default::default()
        };
        let (_bus, sessions, manager) = setup(lenient);
        sessions.stopped.store(true, Ordering::SeqCst);
        let id = manager.submit(&session(), "ls").await.unwrap();
        assert_eq!(manager.status(id).unwrap(), CommandStatus::Accepted);
    }

    #[tokio::test]
    async fn test_history_preserves_submission_order() {
        let (_bus, sessions, manager) = setup(pipelined());
        let texts: Vec<String> = (0..20).map(|i| format!("echo {i}")).collect();
        for text in &texts {
            manager.submit(&session(), text).await.unwrap();
        }
        let history: Vec<String> = manager
            .history(&session())
            .unwrap()
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(history, texts);
        let written: Vec<String> = sessions
            .written()
            .into_iter()
            .map(|w| w.trim_end().to_string())
            .collect();
        assert_eq!(written, texts);
        assert!(manager.history(&SessionId::from("other")).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_write_in_history_order() {
        let (_bus, sessions, manager) = setup(pipelined());
        let manager = Arc::new(manager);
        let mut tasks = Vec::new();
        for i in 0..10 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                manager.submit(&session(), &format!("echo {i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let history: Vec<String> = manager
            .history(&session())
            .unwrap()
            .into_iter()
            .map(|c| format!("{}\n", c.text))
            .collect();
        assert_eq!(history.len(), 10);
        assert_eq!(sessions.written(), history);
    }

    #[tokio::test]
    async fn test_one_in_flight_queues_until_completed() {
        let (bus, sessions, manager) = setup(CommandPolicy::default());
        let (_, mut completed) = bus
            .subscribe_channel(EventFilter::kind(EventKind::CommandCompleted))
            .unwrap();

        let first = manager.submit(&session(), "first").await.unwrap();
        let second = manager.submit(&session(), "second").await.unwrap();
        assert_eq!(manager.status(second).unwrap(), CommandStatus::Pending);
        assert_eq!(sessions.written(), vec!["first\n"]);
        let stats = manager.stats().unwrap();
        assert_eq!((stats.in_flight, stats.queued), (1, 1));

        manager.mark_completed(first, true).await.unwrap();
        assert_eq!(manager.status(first).unwrap(), CommandStatus::Completed);
        assert_eq!(manager.status(second).unwrap(), CommandStatus::Accepted);
        assert_eq!(sessions.written(), vec!["first\n", "second\n"]);

        let event = completed.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::CommandCompleted { command_id, status: CommandStatus::Completed, duration_ms: Some(_) }
                if command_id == first
        ));
    }

    #[tokio::test]
    async fn test_mark_completed_requires_accepted() {
        let (_bus, _sessions, manager) = setup(pipelined());
        let id = manager.submit(&session(), "ls").await.unwrap();
        manager.mark_completed(id, false).await.unwrap();
        assert_eq!(manager.status(id).unwrap(), CommandStatus::Failed);

        let err = manager.mark_completed(id, true).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { status: CommandStatus::Failed, .. }));
        assert!(matches!(
            manager.mark_completed(CommandId(999), true).await.unwrap_err(),
            BridgeError::CommandNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_transitions() {
        let (_bus, sessions, manager) = setup(CommandPolicy::default());
        let first = manager.submit(&session(), "first").await.unwrap();
        let second = manager.submit(&session(), "second").await.unwrap();
        let third = manager.submit(&session(), "third").await.unwrap();

        manager.cancel(second).await.unwrap();
        let cancelled = manager.get(second).unwrap();
        assert_eq!(cancelled.status, CommandStatus::Rejected);
        assert_eq!(cancelled.reason.as_deref(), Some("cancelled"));

        manager.cancel(first).await.unwrap();
        assert_eq!(manager.status(first).unwrap(), CommandStatus::Failed);
        // Cancelling the in-flight command releases the next queued one.
        assert_eq!(manager.status(third).unwrap(), CommandStatus::Accepted);
        assert_eq!(sessions.written(), vec!["first\n", "third\n"]);

        let err = manager.cancel(first).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { action: "cancel", .. }));
    }

    #[tokio::test]
    async fn test_write_failure_marks_failed() {
        let (_bus, sessions, manager) = setup(CommandPolicy {
            require_session_running: false,
            ..Default::default()
        });
        sessions.fail_writes.store(true, Ordering::SeqCst);
        let err = manager.submit(&session(), "ls").await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionClosed(_)));

        let history = manager.history(&session()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_preprocessors_run_in_order() {
        let (_bus, sessions, manager) = setup(pipelined());
        manager.register_preprocessor(Arc::new(Prefix("[a] ")));
        manager.register_preprocessor(Arc::new(Prefix("[b] ")));
        manager.submit(&session(), "echo test").await.unwrap();
        assert_eq!(sessions.written(), vec!["[b] [a] echo test\n"]);

        manager.register_preprocessor(Arc::new(Refuse));
        let id = manager.submit(&session(), "echo again").await.unwrap();
        let cmd = manager.get(id).unwrap();
        assert_eq!(cmd.status, CommandStatus::Rejected);
        assert!(cmd.reason.unwrap().contains("not today"));
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_rejection() {
        let (_bus, sessions, manager) = setup(pipelined());
        let ids = manager
            .submit_batch(&session(), &["echo one", "rm -rf /", "echo three"])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(manager.status(ids[1]).unwrap(), CommandStatus::Rejected);
        assert_eq!(sessions.written(), vec!["echo one\n"]);
    }

    #[tokio::test]
    async fn test_filtering_side_effects_and_stats() {
        let (_bus, _sessions, manager) = setup(pipelined());
        manager
            .submit_request(
                &session(),
                CommandRequest::new("rm file.txt")
                    .with_source("api")
                    .with_metadata("client", "web"),
            )
            .await
            .unwrap();
        manager.submit(&session(), "/compact").await.unwrap();
        manager.submit(&session(), "rm -rf /").await.unwrap();

        let api = manager
            .history_filtered(
                &session(),
                &CommandFilter {
                    source: Some("api".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].metadata["client"], "web");
        assert_eq!(api[0].side_effects, vec![termhub_core::SideEffect::FileDeleted]);

        let last = manager
            .history_filtered(
                &session(),
                &CommandFilter {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(last[0].text, "rm -rf /");

        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_commands, 3);
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.status_counts["rejected"], 1);
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let (_bus, _sessions, manager) = setup(CommandPolicy::default());
        let manager = Arc::new(manager);
        let id = manager.submit(&session(), "sleep 1").await.unwrap();

        let status = manager
            .wait_for_completion(id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(status, CommandStatus::Accepted);

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_for_completion(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.mark_completed(id, true).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_forget_session_drops_lane_and_history() {
        let (_bus, _sessions, manager) = setup(CommandPolicy::default());
        let first = manager.submit(&session(), "echo one").await.unwrap();
        let queued = manager.submit(&session(), "echo two").await.unwrap();
        manager
            .submit(&SessionId::from("ghost"), "echo lost")
            .await
            .unwrap();
        assert_eq!(manager.lanes.lock().unwrap().len(), 2);

        assert_eq!(manager.forget_session(&session()).await.unwrap(), 2);
        assert!(manager.history(&session()).unwrap().is_empty());
        assert!(matches!(
            manager.status(first).unwrap_err(),
            BridgeError::CommandNotFound(_)
        ));
        assert!(matches!(
            manager.wait_for_completion(queued, Duration::from_millis(10)).await,
            Err(BridgeError::CommandNotFound(_))
        ));

        let ghost = SessionId::from("ghost");
        assert_eq!(manager.forget_session(&ghost).await.unwrap(), 1);
        assert!(manager.lanes.lock().unwrap().is_empty());
        assert_eq!(manager.stats().unwrap().total_commands, 0);
        assert_eq!(manager.forget_session(&session()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_limit_evicts_finished_commands() {
        let (_bus, _sessions, manager) = setup(CommandPolicy {
            history_limit: 2,
            allow_pipelining: true,
            ..Default::default()
        });
        let a = manager.submit(&session(), "a").await.unwrap();
        let b = manager.submit(&session(), "b").await.unwrap();
        let c = manager.submit(&session(), "c").await.unwrap();
        // Nothing has finished yet, so nothing can be evicted.
        assert_eq!(manager.history(&session()).unwrap().len(), 3);

        manager.mark_completed(b, true).await.unwrap();
        let ids: Vec<CommandId> = manager
            .history(&session())
            .unwrap()
            .into_iter()
            .map(|cmd| cmd.id)
            .collect();
        assert_eq!(ids, vec![a, c]);
    }
}
