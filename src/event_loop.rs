//! Event loop: handler registration, cache-sync gating and worker lifecycle.
//!
//! State machine:
//! ```text
//! CREATED → WAITING_FOR_SYNC → RUNNING → DRAINING → STOPPED
//!                  ↓
//!               FAILED
//! ```
//! Processing never starts before every registered handler reports its
//! cache synced. A sync failure is terminal.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::handler::Handler;
use crate::informer::ResourceEventHandler;
use crate::queue::{callback, WorkQueue};
use crate::types::{Config, Error, EventType, Object, Result};

/// Event loop lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Created,
    WaitingForSync,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: LoopState) -> bool {
        matches!(
            (self, to),
            (LoopState::Created, LoopState::WaitingForSync)
                | (LoopState::WaitingForSync, LoopState::Running)
                | (LoopState::WaitingForSync, LoopState::Failed)
                | (LoopState::Running, LoopState::Draining)
                | (LoopState::Draining, LoopState::Stopped)
        )
    }
}

/// Forwards informer notifications into a queue under one kind.
#[derive(Debug)]
struct QueueEventHandler {
    queue: WorkQueue,
    kind: String,
}

impl ResourceEventHandler for QueueEventHandler {
    fn on_add(&self, obj: &dyn Object) {
        self.queue.enqueue_add(&self.kind, obj);
    }

    fn on_update(&self, _old: &dyn Object, new: &dyn Object) {
        self.queue.enqueue_update(&self.kind, new);
    }

    fn on_delete(&self, obj: &dyn Object) {
        self.queue.enqueue_delete(&self.kind, obj);
    }
}

/// Dispatches informer events for registered handlers through one named
/// work queue.
pub struct EventLoop {
    name: String,
    config: Config,
    queue: WorkQueue,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    state: watch::Sender<LoopState>,
}

impl EventLoop {
    /// Create a loop whose queue is labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, Config::default())
    }

    pub fn with_config(name: impl Into<String>, config: Config) -> Self {
        let name = name.into();
        let queue = WorkQueue::with_config(name.clone(), config.queue.clone());
        let (state, _) = watch::channel(LoopState::Created);
        Self {
            name,
            config,
            queue,
            handlers: RwLock::new(Vec::new()),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The loop's queue, for enqueueing directly or registering raw
    /// callbacks.
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Register a handler's callbacks under its kind and subscribe the
    /// queue to its informer, if it has one.
    ///
    /// Handlers sharing a kind overwrite each other's callbacks.
    pub fn register(&self, handler: Arc<dyn Handler>) {
        let kind = handler.kind().to_string();

        for event_type in [EventType::Add, EventType::Update, EventType::Delete] {
            let handler = handler.clone();
            self.queue.register_callback(
                &kind,
                event_type,
                callback(move |namespace, name| {
                    let handler = handler.clone();
                    async move {
                        match event_type {
                            EventType::Add => handler.on_add(&namespace, &name).await,
                            EventType::Update => handler.on_update(&namespace, &name).await,
                            EventType::Delete => handler.on_delete(&namespace, &name).await,
                        }
                    }
                }),
            );
        }

        let informer = handler.informer();
        if let Some(informer) = &informer {
            informer.add_event_handler(Arc::new(QueueEventHandler {
                queue: self.queue.clone(),
                kind: kind.clone(),
            }));
        }

        tracing::info!(
            event_loop = %self.name,
            handler = handler.name(),
            kind = %kind,
            has_informer = informer.is_some(),
            "Registered handler"
        );
        self.handlers.write().push(handler);
    }

    /// Wait for caches, process events with `workers` workers until `stop`
    /// fires, then drain.
    ///
    /// Only cache-sync failures are returned; per-item failures are handled
    /// inside the queue.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<()> {
        self.transition(LoopState::WaitingForSync)?;
        tracing::info!(event_loop = %self.name, "Waiting for informer caches to sync");

        if let Err(e) = self.wait_for_sync(&stop).await {
            self.transition(LoopState::Failed)?;
            tracing::error!(event_loop = %self.name, error = %e, "Failed to sync caches");
            return Err(e);
        }

        self.transition(LoopState::Running)?;
        tracing::info!(event_loop = %self.name, workers, "Caches synced, processing events");

        let draining = async {
            stop.cancelled().await;
            if let Err(e) = self.transition(LoopState::Draining) {
                tracing::warn!(event_loop = %self.name, error = %e, "Unexpected state on stop");
            }
        };
        tokio::join!(self.queue.run(workers, stop.clone()), draining);

        self.transition(LoopState::Stopped)?;
        tracing::info!(event_loop = %self.name, "Event loop stopped");
        Ok(())
    }

    async fn wait_for_sync(&self, stop: &CancellationToken) -> Result<()> {
        let settings = &self.config.event_loop;
        let deadline = settings.sync_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let pending = self.unsynced_handlers();
            if pending.is_empty() {
                return Ok(());
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::cache_sync(
                    &self.name,
                    format!(
                        "timed out after {:?} waiting for: {}",
                        settings.sync_timeout.unwrap_or_default(),
                        pending.join(", ")
                    ),
                ));
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    return Err(Error::cache_sync(
                        &self.name,
                        "stop signal received before caches synced",
                    ));
                }
                _ = tokio::time::sleep(settings.sync_poll_interval) => {}
            }
        }
    }

    fn unsynced_handlers(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .filter(|h| !h.has_synced())
            .map(|h| h.name().to_string())
            .collect()
    }

    fn transition(&self, to: LoopState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                *current = to;
                true
            } else {
                result = Err(Error::state_transition(format!(
                    "event loop {}: cannot move from {:?} to {:?}",
                    self.name, current, to
                )));
                false
            }
        });
        result
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<String> = self
            .handlers
            .read()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("handlers", &handlers)
            .field("queue_len", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultHandler;
    use crate::informer::MemoryInformer;
    use crate::types::{EventLoopConfig, HandlerResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Recording {
        base: DefaultHandler,
        events: mpsc::UnboundedSender<(EventType, String, String)>,
    }

    #[async_trait]
    impl Handler for Recording {
        fn name(&self) -> &str {
            "Recording"
        }

        fn base(&self) -> Option<&DefaultHandler> {
            Some(&self.base)
        }

        async fn on_add(&self, namespace: &str, name: &str) -> HandlerResult {
            self.events
                .send((EventType::Add, namespace.to_string(), name.to_string()))?;
            Ok(())
        }
    }

    fn config(sync_timeout: Option<Duration>) -> Config {
        Config {
            event_loop: EventLoopConfig {
                workers: 1,
                sync_timeout,
                sync_poll_interval: Duration::from_millis(5),
            },
            ..Config::default()
        }
    }

    fn recording(
        informer: Arc<MemoryInformer>,
    ) -> (Arc<Recording>, mpsc::UnboundedReceiver<(EventType, String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recording {
            base: DefaultHandler::new(informer),
            events: tx,
        });
        (handler, rx)
    }

    #[test]
    fn test_valid_transitions() {
        use LoopState::*;
        assert!(Created.can_transition_to(WaitingForSync));
        assert!(WaitingForSync.can_transition_to(Running));
        assert!(WaitingForSync.can_transition_to(Failed));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
    }

    #[test]
    fn test_sync_cannot_be_skipped() {
        use LoopState::*;
        assert!(!Created.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(WaitingForSync));
        assert!(!Failed.can_transition_to(WaitingForSync));
        assert!(Stopped.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[tokio::test]
    async fn test_sync_timeout_fails_startup() {
        let informer = Arc::new(MemoryInformer::new());
        informer.upsert(json!({ "metadata": { "namespace": "ns", "name": "a" } })).unwrap();
        let (handler, mut rx) = recording(informer);

        let event_loop =
            EventLoop::with_config("never-synced", config(Some(Duration::from_millis(30))));
        event_loop.register(handler);

        let err = event_loop.run(1, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_sync_failure());
        assert!(err.to_string().contains("Recording"));
        assert_eq!(event_loop.state(), LoopState::Failed);
        assert!(rx.try_recv().is_err(), "no callback may run before sync");
    }

    #[tokio::test]
    async fn test_stop_during_sync_fails_startup() {
        let informer = Arc::new(MemoryInformer::new());
        let (handler, _rx) = recording(informer);
        let event_loop = EventLoop::with_config("stopped-early", config(None));
        event_loop.register(handler);

        let stop = CancellationToken::new();
        stop.cancel();
        let err = event_loop.run(1, stop).await.unwrap_err();
        assert!(matches!(err, Error::CacheSync { .. }));
        assert_eq!(event_loop.state(), LoopState::Failed);
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let event_loop = EventLoop::with_config("once", config(None));
        let stop = CancellationToken::new();
        stop.cancel();
        event_loop.run(1, stop.clone()).await.unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);

        let err = event_loop.run(1, stop).await.unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
    }

    #[tokio::test]
    async fn test_processing_waits_for_sync() {
        let informer = Arc::new(MemoryInformer::new());
        informer
            .upsert(json!({ "metadata": { "namespace": "default", "name": "web-0" } }))
            .unwrap();
        let (handler, mut rx) = recording(informer.clone());

        let event_loop = Arc::new(EventLoop::with_config("gated", config(None)));
        event_loop.register(handler);
        let mut states = event_loop.subscribe_state();

        let stop = CancellationToken::new();
        let runner = {
            let event_loop = event_loop.clone();
            let stop = stop.clone();
            tokio::spawn(async move { event_loop.run(1, stop).await })
        };

        states
            .wait_for(|s| *s == LoopState::WaitingForSync)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(event_loop.queue().len(), 1);

        informer.mark_synced();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            (EventType::Add, "default".to_string(), "web-0".to_string())
        );
        assert_eq!(event_loop.state(), LoopState::Running);

        stop.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn test_debug_lists_handlers() {
        let informer = Arc::new(MemoryInformer::new());
        let (handler, _rx) = recording(informer);
        let event_loop = EventLoop::new("debug");
        event_loop.register(handler);

        let rendered = format!("{:?}", event_loop);
        assert!(rendered.contains("\"Recording\""));
        assert!(rendered.contains("Created"));
    }
}
