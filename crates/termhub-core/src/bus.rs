//! In-process publish/subscribe hub.
//!
//! Every subscription owns an unbounded queue drained by its own task, so a
//! slow handler only delays itself. Sequence numbers are assigned and events
//! are enqueued under one lock, which makes each queue's order equal to
//! publish order.

use crate::config::BusConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::event::{ErrorKind, Event, EventDraft, EventFilter, EventPayload, HistoryQuery};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Subscription handle returned by [`EventBus::subscribe`].
pub type SubscriptionId = u64;

/// A subscriber callback.
///
/// Returning `Err` (or panicking) is recorded as a handler fault; the
/// subscription stays active.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Snapshot returned by [`EventBus::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub running: bool,
    pub active_handlers: usize,
    /// Keyed by event kind topic, `"*"` for wildcard subscriptions.
    pub subscriber_counts: BTreeMap<String, usize>,
    pub events_published: u64,
    pub handler_faults: u64,
    pub history_len: usize,
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Arc<Event>>,
    removed: Arc<AtomicBool>,
}

struct BusState {
    running: bool,
    next_seq: u64,
    next_sub_id: SubscriptionId,
    /// In subscription order.
    subscribers: Vec<Subscriber>,
    workers: Vec<(SubscriptionId, JoinHandle<()>)>,
    history: VecDeque<Arc<Event>>,
}

struct Inner {
    state: Mutex<BusState>,
    active_handlers: AtomicUsize,
    events_published: AtomicU64,
    handler_faults: AtomicU64,
    history_limit: usize,
}

/// The event hub. Construct one per core instance and share it as
/// `Arc<EventBus>`; call [`EventBus::shutdown`] to drain it.
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState {
                    running: true,
                    next_seq: 0,
                    next_sub_id: 1,
                    subscribers: Vec::new(),
                    workers: Vec::new(),
                    history: VecDeque::new(),
                }),
                active_handlers: AtomicUsize::new(0),
                events_published: AtomicU64::new(0),
                handler_faults: AtomicU64::new(0),
                history_limit,
            }),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.history_limit)
    }

    /// Register `handler` for events matching `filter`.
    ///
    /// Must be called from within a tokio runtime: each subscription gets its
    /// own delivery task.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> BridgeResult<SubscriptionId> {
        let mut state = self.inner.lock()?;
        if !state.running {
            return Err(BridgeError::BusClosed);
        }
        let id = state.next_sub_id;
        state.next_sub_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let removed = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(deliver(
            id,
            handler,
            rx,
            Arc::clone(&removed),
            Arc::downgrade(&self.inner),
        ));

        debug!(subscription = id, kind = filter.key(), "subscribed");
        state.subscribers.push(Subscriber {
            id,
            filter,
            tx,
            removed,
        });
        state.workers.push((id, worker));
        Ok(id)
    }

    /// Subscribe with an async closure.
    pub fn subscribe_fn<F, Fut>(&self, filter: EventFilter, f: F) -> BridgeResult<SubscriptionId>
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(filter, handler_fn(f))
    }

    /// Subscribe and receive matching events on a channel.
    pub fn subscribe_channel(
        &self,
        filter: EventFilter,
    ) -> BridgeResult<(SubscriptionId, mpsc::UnboundedReceiver<Arc<Event>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_fn(filter, move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)
                    .map_err(|_| anyhow::anyhow!("subscriber channel closed"))
            }
        })?;
        Ok((id, rx))
    }

    /// Remove a subscription. Returns false if it was not found.
    ///
    /// A handler already running finishes normally; nothing further is
    /// delivered to it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> BridgeResult<bool> {
        let mut state = self.inner.lock()?;
        let Some(pos) = state.subscribers.iter().position(|s| s.id == id) else {
            warn!(subscription = id, "unsubscribe of unknown subscription");
            return Ok(false);
        };
        let sub = state.subscribers.remove(pos);
        sub.removed.store(true, Ordering::Release);
        // Detach the worker; it exits once its sender (dropped here) is gone.
        state.workers.retain(|(worker_id, _)| *worker_id != id);
        debug!(subscription = id, "unsubscribed");
        Ok(true)
    }

    /// Stamp `draft` and enqueue it for every matching subscriber.
    ///
    /// Never waits for handlers. Returns the assigned sequence number.
    pub fn publish(&self, draft: EventDraft) -> BridgeResult<u64> {
        self.inner.publish(draft)
    }

    /// Events retained in history that match `query`, oldest first.
    pub fn history(&self, query: &HistoryQuery) -> BridgeResult<Vec<Arc<Event>>> {
        let state = self.inner.lock()?;
        let mut matched: Vec<Arc<Event>> = state
            .history
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        Ok(matched)
    }

    pub fn clear_history(&self) -> BridgeResult<()> {
        self.inner.lock()?.history.clear();
        Ok(())
    }

    /// Number of handlers currently executing.
    pub fn active_handlers(&self) -> usize {
        self.inner.active_handlers.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BridgeResult<BusStats> {
        let state = self.inner.lock()?;
        let mut subscriber_counts = BTreeMap::new();
        for sub in &state.subscribers {
            *subscriber_counts
                .entry(sub.filter.key().to_string())
                .or_insert(0) += 1;
        }
        Ok(BusStats {
            running: state.running,
            active_handlers: self.active_handlers(),
            subscriber_counts,
            events_published: self.inner.events_published.load(Ordering::SeqCst),
            handler_faults: self.inner.handler_faults.load(Ordering::SeqCst),
            history_len: state.history.len(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().map(|s| s.running).unwrap_or(false)
    }

    /// Stop accepting events, drop every subscription and wait until each
    /// subscriber has drained its queue.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let workers = {
            let mut state = self.inner.lock()?;
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.subscribers.clear();
            std::mem::take(&mut state.workers)
        };
        info!(subscribers = workers.len(), "event bus shutting down");
        for (id, worker) in workers {
            if let Err(e) = worker.await {
                warn!(subscription = id, error = %e, "subscriber task ended abnormally");
            }
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Inner {
    fn lock(&self) -> BridgeResult<MutexGuard<'_, BusState>> {
        self.state.lock().map_err(|e| {
            error!("event bus subscription table poisoned");
            BridgeError::BusPoisoned(e.to_string())
        })
    }

    fn publish(&self, draft: EventDraft) -> BridgeResult<u64> {
        let mut state = self.lock()?;
        if !state.running {
            return Err(BridgeError::BusClosed);
        }
        state.next_seq += 1;
        let event = Arc::new(Event {
            seq: state.next_seq,
            session_id: draft.session_id,
            source: draft.source,
            timestamp: Utc::now(),
            payload: draft.payload,
        });

        for sub in state.subscribers.iter().filter(|s| s.filter.matches(&event)) {
            // A closed queue means the worker is already gone.
            let _ = sub.tx.send(Arc::clone(&event));
        }

        state.history.push_back(Arc::clone(&event));
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        drop(state);

        self.events_published.fetch_add(1, Ordering::SeqCst);
        Ok(event.seq)
    }

    fn record_fault(&self, subscription: SubscriptionId, event: &Event, message: String) {
        self.handler_faults.fetch_add(1, Ordering::SeqCst);
        warn!(
            subscription,
            event_seq = event.seq,
            kind = %event.kind(),
            error = %message,
            "event handler failed"
        );
        // Faults while handling an Error event are only logged.
        if matches!(event.payload, EventPayload::Error { .. }) {
            return;
        }
        let draft = EventDraft::new(
            event.session_id.clone(),
            "bus",
            EventPayload::Error {
                error: ErrorKind::HandlerFault {
                    subscription,
                    event_seq: event.seq,
                },
                message,
            },
        );
        if let Err(e) = self.publish(draft) {
            debug!(error = %e, "could not publish handler fault");
        }
    }
}

/// Keeps `active_handlers` elevated for as long as it lives.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn deliver(
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
    removed: Arc<AtomicBool>,
    bus: Weak<Inner>,
) {
    while let Some(event) = rx.recv().await {
        if removed.load(Ordering::Acquire) {
            break;
        }
        let Some(inner) = bus.upgrade() else {
            break;
        };

        let outcome = {
            let _active = ActiveGuard::enter(&inner.active_handlers);
            AssertUnwindSafe(handler.handle(Arc::clone(&event)))
                .catch_unwind()
                .await
        };

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(message) = failure {
            inner.record_fault(id, &event, message);
        }
    }
    debug!(subscription = id, "subscriber task finished");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::ids::SessionId;
    use std::time::Duration;
    use tokio::sync::watch;

    fn output(session: &str, text: &str) -> EventDraft {
        EventDraft::new(
            SessionId::from(session),
            "terminal",
            EventPayload::Output {
                data: text.as_bytes().to_vec(),
                prompt_detected: false,
            },
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Arc<Event>>) -> Arc<Event> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let bus = EventBus::new(100);
        let (_, mut rx) = bus.subscribe_channel(EventFilter::kind(EventKind::Output)).unwrap();

        let seq = bus.publish(output("s", "test data")).unwrap();
        let event = recv(&mut rx).await;
        assert_eq!(event.seq, seq);
        assert_eq!(event.output(), Some(&b"test data"[..]));
        assert_eq!(event.source, "terminal");
    }

    #[tokio::test]
    async fn test_filter_by_kind_and_session() {
        let bus = EventBus::new(100);
        let (_, mut only_a) = bus
            .subscribe_channel(EventFilter::kind(EventKind::Output).for_session("a".into()))
            .unwrap();
        let (_, mut closed) = bus
            .subscribe_channel(EventFilter::kind(EventKind::SessionClosed))
            .unwrap();

        bus.publish(output("b", "ignored")).unwrap();
        bus.publish(output("a", "kept")).unwrap();
        bus.publish(EventDraft::new(
            "a".into(),
            "terminal",
            EventPayload::SessionClosed { exit: None },
        ))
        .unwrap();

        assert_eq!(recv(&mut only_a).await.output(), Some(&b"kept"[..]));
        assert_eq!(recv(&mut closed).await.kind(), EventKind::SessionClosed);
        assert!(only_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new(1000);
        let (_, mut rx) = bus.subscribe_channel(EventFilter::all()).unwrap();

        let mut published = Vec::new();
        for i in 0..50 {
            published.push(bus.publish(output("s", &i.to_string())).unwrap());
        }
        let mut seen = Vec::new();
        for _ in 0..50 {
            seen.push(recv(&mut rx).await.seq);
        }
        assert_eq!(seen, published);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribers_see_every_event_once() {
        let bus = Arc::new(EventBus::new(1000));
        let filter = EventFilter::kind(EventKind::Output).for_session("s".into());

        let (a, b) = tokio::join!(
            {
                let bus = Arc::clone(&bus);
                let filter = filter.clone();
                async move { bus.subscribe_channel(filter).unwrap() }
            },
            {
                let bus = Arc::clone(&bus);
                let filter = filter.clone();
                async move { bus.subscribe_channel(filter).unwrap() }
            }
        );
        let (mut rx_a, mut rx_b) = (a.1, b.1);

        for i in 0..100 {
            bus.publish(output("s", &i.to_string())).unwrap();
        }
        for rx in [&mut rx_a, &mut rx_b] {
            let mut payloads = Vec::new();
            for _ in 0..100 {
                payloads.push(String::from_utf8(recv(rx).await.output().unwrap().to_vec()).unwrap());
            }
            let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
            assert_eq!(payloads, expected);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_others() {
        let bus = EventBus::new(100);
        let (gate_tx, gate_rx) = watch::channel(false);
        bus.subscribe_fn(EventFilter::all(), move |_| {
            let mut gate = gate_rx.clone();
            async move {
                gate.wait_for(|open| *open).await?;
                Ok(())
            }
        })
        .unwrap();
        let (_, mut rx) = bus.subscribe_channel(EventFilter::all()).unwrap();

        bus.publish(output("s", "1")).unwrap();
        bus.publish(output("s", "2")).unwrap();
        recv(&mut rx).await;
        recv(&mut rx).await;
        wait_until(|| bus.active_handlers() == 1).await;
        gate_tx.send(true).unwrap();
        wait_until(|| bus.active_handlers() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_active_handler_gauge_tracks_blocked_handlers() {
        let bus = EventBus::new(100);
        let (gate_tx, gate_rx) = watch::channel(false);
        for _ in 0..3 {
            let gate_rx = gate_rx.clone();
            bus.subscribe_fn(EventFilter::kind(EventKind::Output), move |_| {
                let mut gate = gate_rx.clone();
                async move {
                    gate.wait_for(|open| *open).await?;
                    anyhow::Ok(())
                }
            })
            .unwrap();
        }

        bus.publish(output("s", "block")).unwrap();
        wait_until(|| bus.active_handlers() == 3).await;
        assert_eq!(bus.stats().unwrap().active_handlers, 3);

        gate_tx.send(true).unwrap();
        wait_until(|| bus.active_handlers() == 0).await;
    }

    #[tokio::test]
    async fn test_handler_error_is_isolated() {
        let bus = EventBus::new(100);
        let failing = bus
            .subscribe_fn(EventFilter::kind(EventKind::Output), |_| async {
                Err::<(), _>(anyhow::anyhow!("handler error"))
            })
            .unwrap();
        let (_, mut good) = bus.subscribe_channel(EventFilter::kind(EventKind::Output)).unwrap();
        let (_, mut errors) = bus.subscribe_channel(EventFilter::kind(EventKind::Error)).unwrap();

        let seq = bus.publish(output("s", "x")).unwrap();
        assert_eq!(recv(&mut good).await.seq, seq);

        let fault = recv(&mut errors).await;
        match &fault.payload {
            EventPayload::Error {
                error: ErrorKind::HandlerFault {
                    subscription,
                    event_seq,
                },
                message,
            } => {
                assert_eq!(*subscription, failing);
                assert_eq!(*event_seq, seq);
                assert!(message.contains("handler error"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(fault.session_id, SessionId::from("s"));

        // Still subscribed: a second event faults again.
        bus.publish(output("s", "y")).unwrap();
        recv(&mut good).await;
        recv(&mut errors).await;
        assert_eq!(bus.stats().unwrap().handler_faults, 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new(100);
        bus.subscribe_fn(EventFilter::kind(EventKind::Output), |_| async {
            if true {
                panic!("boom");
            }
            anyhow::Ok(())
        })
        .unwrap();
        let (_, mut errors) = bus.subscribe_channel(EventFilter::kind(EventKind::Error)).unwrap();

        bus.publish(output("s", "x")).unwrap();
        let fault = recv(&mut errors).await;
        assert!(matches!(
            &fault.payload,
            EventPayload::Error { message, .. } if message.contains("boom")
        ));
        wait_until(|| bus.active_handlers() == 0).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(100);
        let (id, mut rx) = bus.subscribe_channel(EventFilter::all()).unwrap();

        bus.publish(output("s", "1")).unwrap();
        recv(&mut rx).await;

        assert!(bus.unsubscribe(id).unwrap());
        bus.publish(output("s", "2")).unwrap();
        // The worker drops the handler (and with it the sender) on exit.
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(next.is_none());
        assert!(!bus.unsubscribe(id).unwrap());
        assert!(!bus.unsubscribe(999).unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_during_dispatch_lets_in_flight_finish() {
        let bus = EventBus::new(100);
        let (gate_tx, gate_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let slow = bus
            .subscribe_fn(EventFilter::all(), move |event| {
                let mut gate = gate_rx.clone();
                let done_tx = done_tx.clone();
                async move {
                    gate.wait_for(|open| *open).await?;
                    done_tx.send(event.seq)?;
                    anyhow::Ok(())
                }
            })
            .unwrap();
        let (_, mut other) = bus.subscribe_channel(EventFilter::all()).unwrap();

        let first = bus.publish(output("s", "1")).unwrap();
        wait_until(|| bus.active_handlers() == 1).await;
        bus.publish(output("s", "2")).unwrap();
        bus.unsubscribe(slow).unwrap();
        gate_tx.send(true).unwrap();

        assert_eq!(done_rx.recv().await, Some(first));
        assert_eq!(done_rx.recv().await, None);
        recv(&mut other).await;
        recv(&mut other).await;
    }

    #[tokio::test]
    async fn test_history_limit_and_query() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.publish(output("s", &format!("test_{i}"))).unwrap();
        }
        let all = bus.history(&HistoryQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].output(), Some(&b"test_2"[..]));
        assert_eq!(all[2].output(), Some(&b"test_4"[..]));

        let bus = EventBus::new(100);
        bus.publish(output("s", "1")).unwrap();
        bus.publish(EventDraft::new(
            "s".into(),
            "context",
            EventPayload::ContextWarning {
                percentage: 91.0,
                token_count: 182_000,
                token_limit: 200_000,
            },
        ))
        .unwrap();
        bus.publish(output("t", "3")).unwrap();

        let outputs = bus
            .history(&HistoryQuery {
                kind: Some(EventKind::Output),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(outputs.len(), 2);

        let from_context = bus
            .history(&HistoryQuery {
                source: Some("context".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(from_context.len(), 1);

        let limited = bus
            .history(&HistoryQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].session_id, SessionId::from("t"));

        bus.clear_history().unwrap();
        assert!(bus.history(&HistoryQuery::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let bus = EventBus::new(100);
        bus.subscribe_fn(EventFilter::kind(EventKind::Output), |_| async { anyhow::Ok(()) })
            .unwrap();
        bus.subscribe_fn(EventFilter::kind(EventKind::Output), |_| async { anyhow::Ok(()) })
            .unwrap();
        bus.subscribe_fn(EventFilter::kind(EventKind::ContextUpdated), |_| async { anyhow::Ok(()) })
            .unwrap();
        bus.subscribe_fn(EventFilter::all(), |_| async { anyhow::Ok(()) }).unwrap();

        bus.publish(output("s", "1")).unwrap();

        let stats = bus.stats().unwrap();
        assert!(stats.running);
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.history_len, 1);
        assert_eq!(stats.subscriber_counts["session.output"], 2);
        assert_eq!(stats.subscriber_counts["context.updated"], 1);
        assert_eq!(stats.subscriber_counts["*"], 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() {
        let bus = EventBus::new(100);
        let (_, mut rx) = bus.subscribe_channel(EventFilter::all()).unwrap();
        for i in 0..10 {
            bus.publish(output("s", &i.to_string())).unwrap();
        }
        bus.shutdown().await.unwrap();

        let mut drained = 0;
        while rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 10);
        assert!(!bus.is_running());
        assert!(matches!(bus.publish(output("s", "late")), Err(BridgeError::BusClosed)));
        assert!(matches!(
            bus.subscribe_fn(EventFilter::all(), |_| async { anyhow::Ok(()) }),
            Err(BridgeError::BusClosed)
        ));
        // Idempotent.
        bus.shutdown().await.unwrap();
    }
}
