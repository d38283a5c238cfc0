//! Deduplicating, rate-limited work queue with a worker pool.
//!
//! The queue carries [`WorkItem`]s (kind + event type + namespace/name) from
//! change notifications to registered callbacks:
//!   - **Dedup**: an item identical to one still waiting is coalesced
//!   - **Per-key serialisation**: at most one in-flight item per
//!     (kind, namespace, name); later items for that key are parked until
//!     the in-flight one is marked done
//!   - **Retry**: failed callbacks are requeued through a [`RateLimiter`] up
//!     to `RetryConfig::max_retries`, then dropped and logged
//!   - **Drain**: once the stop token fires no new items are dequeued, and
//!     [`WorkQueue::run`] returns after in-flight callbacks finish
//!
//! No ordering is guaranteed across distinct keys.

pub mod rate_limiter;
pub mod registry;

pub use rate_limiter::{
    default_rate_limiter, BucketRateLimiter, ItemExponentialBackoff, MaxOfRateLimiter,
    RateLimiter,
};
pub use registry::{callback, Callback, HandlerRegistry, RegistryStats};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::types::{BoxError, EventType, HandlerResult, ItemRef, Object, QueueConfig, WorkItem};

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing what a queue has done since it was created.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items accepted onto the queue (including requeues).
    pub enqueued: u64,
    /// Adds merged into an identical waiting item.
    pub coalesced: u64,
    /// Objects dropped at enqueue because no key could be derived.
    pub malformed: u64,
    /// Callbacks that completed successfully.
    pub processed: u64,
    /// Items dequeued with no callback registered for them.
    pub no_handler: u64,
    /// Failed callbacks scheduled for another attempt.
    pub retried: u64,
    /// Items dropped after exhausting their retries.
    pub dropped: u64,
    /// Callbacks that panicked (also counted as failures).
    pub panicked: u64,
}

// =============================================================================
// Queue state
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    /// Items ready for a worker, oldest first.
    queue: VecDeque<WorkItem>,
    /// Items waiting in `queue` or `parked`; the dedup set.
    dirty: HashSet<WorkItem>,
    /// Keys with a callback in flight.
    processing: HashSet<ItemRef>,
    /// Items held back because their key is in flight.
    parked: HashMap<ItemRef, VecDeque<WorkItem>>,
    parked_len: usize,
    shutting_down: bool,
}

impl QueueState {
    fn park(&mut self, item_ref: ItemRef, item: WorkItem) {
        self.parked.entry(item_ref).or_default().push_back(item);
        self.parked_len += 1;
    }

    /// Take the oldest item whose key is not in flight.
    fn pop_ready(&mut self) -> Option<WorkItem> {
        while let Some(item) = self.queue.pop_front() {
            let item_ref = item.item_ref();
            if self.processing.contains(&item_ref) {
                self.park(item_ref, item);
                continue;
            }
            self.dirty.remove(&item);
            self.processing.insert(item_ref);
            return Some(item);
        }
        None
    }

    /// Release a key and return its parked items to the head of the queue.
    fn release(&mut self, item_ref: &ItemRef) -> bool {
        self.processing.remove(item_ref);
        match self.parked.remove(item_ref) {
            Some(parked) => {
                self.parked_len -= parked.len();
                for item in parked.into_iter().rev() {
                    self.queue.push_front(item);
                }
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    available: Notify,
    registry: HandlerRegistry,
    rate_limiter: Box<dyn RateLimiter>,
    /// Cancels pending delayed adds when the queue shuts down.
    shutdown: CancellationToken,
    waiting: AtomicUsize,
    stats: Mutex<QueueStats>,
}

// =============================================================================
// WorkQueue
// =============================================================================

/// Named work queue. Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Create a queue with the default retry policy.
    ///
    /// `name` is a diagnostic label attached to every log line.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, QueueConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: QueueConfig) -> Self {
        let rate_limiter = default_rate_limiter(&config.retry, config.rate_limit.as_ref());
        Self::with_rate_limiter(name, config, rate_limiter)
    }

    /// Create a queue with a custom requeue policy. `config.rate_limit` is
    /// ignored; `config.retry.max_retries` still bounds retries.
    pub fn with_rate_limiter(
        name: impl Into<String>,
        config: QueueConfig,
        rate_limiter: Box<dyn RateLimiter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                state: Mutex::new(QueueState::default()),
                available: Notify::new(),
                registry: HandlerRegistry::new(),
                rate_limiter,
                shutdown: CancellationToken::new(),
                waiting: AtomicUsize::new(0),
                stats: Mutex::new(QueueStats::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Queue an Add event for `obj` under `kind`.
    pub fn enqueue_add(&self, kind: &str, obj: &dyn Object) {
        self.enqueue(kind, EventType::Add, obj);
    }

    /// Queue an Update event for `obj` under `kind`.
    pub fn enqueue_update(&self, kind: &str, obj: &dyn Object) {
        self.enqueue(kind, EventType::Update, obj);
    }

    /// Queue a Delete event for `obj` under `kind`.
    pub fn enqueue_delete(&self, kind: &str, obj: &dyn Object) {
        self.enqueue(kind, EventType::Delete, obj);
    }

    /// Never fails: objects without a derivable key are logged and dropped.
    pub fn enqueue(&self, kind: &str, event_type: EventType, obj: &dyn Object) {
        match WorkItem::from_object(kind, event_type, obj) {
            Ok(item) => {
                tracing::debug!(
                    queue = %self.inner.name,
                    kind = %item.kind,
                    event_type = %item.event_type,
                    namespace = %item.key.namespace,
                    name = %item.key.name,
                    "Enqueued event"
                );
                self.add(item);
            }
            Err(e) => {
                self.record(|s| s.malformed += 1);
                tracing::warn!(
                    queue = %self.inner.name,
                    kind = kind,
                    event_type = %event_type,
                    error = %e,
                    "Dropping object: cannot derive key"
                );
            }
        }
    }

    /// Add an item. Returns false if it was coalesced or the queue is
    /// shutting down.
    pub fn add(&self, item: WorkItem) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            tracing::debug!(queue = %self.inner.name, item = %item, "Queue shutting down, add ignored");
            return false;
        }
        if !state.dirty.insert(item.clone()) {
            drop(state);
            self.record(|s| s.coalesced += 1);
            return false;
        }

        let item_ref = item.item_ref();
        if state.processing.contains(&item_ref) {
            state.park(item_ref, item);
        } else {
            state.queue.push_back(item);
            drop(state);
            self.inner.available.notify_one();
        }
        self.record(|s| s.enqueued += 1);
        true
    }

    /// Add an item once `delay` has elapsed. Pending delayed adds are
    /// discarded when the queue shuts down.
    pub fn add_after(&self, item: WorkItem, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(
                    queue = %self.inner.name,
                    item = %item,
                    "No async runtime for delayed add, adding immediately"
                );
                self.add(item);
                return;
            }
        };

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(item);
                }
            }
            queue.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Add an item after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, item: WorkItem) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the retry history of an item.
    pub fn forget(&self, item: &WorkItem) {
        self.inner.rate_limiter.forget(item);
    }

    /// Retries recorded for an item since it was last forgotten.
    pub fn num_requeues(&self, item: &WorkItem) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    /// Wait for the next item whose key is not in flight.
    ///
    /// Returns `None` once the queue is shutting down. Every returned item
    /// must be passed to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register before checking state so a shutdown between the
            // check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.pop_ready() {
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.available.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark an item's processing finished, releasing its key.
    pub fn done(&self, item: &WorkItem) {
        let released = self.inner.state.lock().release(&item.item_ref());
        if released {
            self.inner.available.notify_one();
        }
    }

    /// Stop handing out items, drop further adds and cancel pending delayed
    /// adds. Idempotent.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        self.inner.shutdown.cancel();
        self.inner.available.notify_waiters();
        tracing::debug!(queue = %self.inner.name, "Work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register the callback run for Add events of `kind`.
    pub fn register_add_handler<F, Fut>(&self, kind: &str, f: F)
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_callback(kind, EventType::Add, callback(f));
    }

    /// Register the callback run for Update events of `kind`.
    pub fn register_update_handler<F, Fut>(&self, kind: &str, f: F)
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_callback(kind, EventType::Update, callback(f));
    }

    /// Register the callback run for Delete events of `kind`.
    pub fn register_delete_handler<F, Fut>(&self, kind: &str, f: F)
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_callback(kind, EventType::Delete, callback(f));
    }

    pub fn register_callback(&self, kind: &str, event_type: EventType, callback: Callback) {
        self.inner.registry.register(kind, event_type, callback);
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Approximate number of items waiting for a worker.
    ///
    /// Counts queued and parked items; excludes in-flight items and items
    /// sleeping in a retry backoff. Not authoritative under concurrent use.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.queue.len() + state.parked_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items sleeping in a retry backoff.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Keys with a callback currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.stats.lock().clone()
    }

    fn record(&self, update: impl FnOnce(&mut QueueStats)) {
        update(&mut self.inner.stats.lock());
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Run `workers` worker loops until `stop` fires, then drain.
    ///
    /// After `stop` fires no new items are dequeued; this returns once every
    /// in-flight callback has finished. A callback that never completes
    /// blocks the drain.
    pub async fn run(&self, workers: usize, stop: CancellationToken) {
        let workers = if workers == 0 {
            tracing::warn!(queue = %self.inner.name, "Worker count 0 requested, using 1");
            1
        } else {
            workers
        };

        tracing::info!(queue = %self.inner.name, workers, "Starting workers");

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let queue = self.clone();
            let stop = stop.clone();
            tasks.spawn(async move { queue.worker(worker_id, stop).await });
        }

        stop.cancelled().await;
        tracing::info!(
            queue = %self.inner.name,
            in_flight = self.in_flight(),
            "Stop signal received, draining workers"
        );
        self.shut_down();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(queue = %self.inner.name, "Worker task failed: {}", e);
            }
        }

        tracing::info!(queue = %self.inner.name, "Workers stopped");
    }

    async fn worker(&self, worker_id: usize, stop: CancellationToken) {
        loop {
            let item = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                item = self.get() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process(item).await;
        }
        tracing::debug!(queue = %self.inner.name, worker_id, "Worker exiting");
    }

    /// Dispatch one item and settle it: forget, requeue or drop.
    async fn process(&self, item: WorkItem) {
        let Some(callback) = self.inner.registry.lookup(&item.kind, item.event_type) else {
            tracing::debug!(
                queue = %self.inner.name,
                kind = %item.kind,
                event_type = %item.event_type,
                namespace = %item.key.namespace,
                name = %item.key.name,
                "No handler registered, skipping"
            );
            self.record(|s| s.no_handler += 1);
            self.forget(&item);
            self.done(&item);
            return;
        };

        tracing::info!(
            queue = %self.inner.name,
            kind = %item.kind,
            event_type = %item.event_type,
            namespace = %item.key.namespace,
            name = %item.key.name,
            "Dispatching event"
        );

        let namespace = item.key.namespace.clone();
        let name = item.key.name.clone();
        let outcome = AssertUnwindSafe(async move { callback(namespace, name).await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                self.record(|s| s.panicked += 1);
                Err(panic_message(payload))
            }
        };

        match result {
            Ok(()) => {
                self.record(|s| s.processed += 1);
                self.forget(&item);
            }
            Err(err) => self.handle_failure(&item, err),
        }
        self.done(&item);
    }

    fn handle_failure(&self, item: &WorkItem, err: BoxError) {
        let attempts = self.num_requeues(item);
        let max_retries = self.inner.config.retry.max_retries;

        if attempts < max_retries {
            self.record(|s| s.retried += 1);
            tracing::warn!(
                queue = %self.inner.name,
                kind = %item.kind,
                event_type = %item.event_type,
                namespace = %item.key.namespace,
                name = %item.key.name,
                attempt = attempts + 1,
                max_retries,
                error = %err,
                "Handler failed, requeueing"
            );
            self.add_rate_limited(item.clone());
            return;
        }

        self.record(|s| s.dropped += 1);
        self.forget(item);
        tracing::error!(
            queue = %self.inner.name,
            kind = %item.kind,
            event_type = %item.event_type,
            namespace = %item.key.namespace,
            name = %item.key.name,
            retries = attempts,
            error = %err,
            "Dropping item after exhausting retries"
        );
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> BoxError {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    format!("handler panicked: {}", msg).into()
}

// =============================================================================
// Tests
// =============================================================================
