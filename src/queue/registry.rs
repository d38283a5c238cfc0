//! Callback registry: (kind, event type) → handler callback.
//!
//! Read by every worker on every dequeue, written by registration calls that
//! may arrive while workers are running.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::types::{EventType, HandlerResult};

/// Type-erased async callback invoked with `(namespace, name)`.
pub type Callback = Arc<dyn Fn(String, String) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box an async closure into a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |namespace, name| Box::pin(f(namespace, name)))
}

/// Callbacks registered for one kind. Missing entries are no-ops.
#[derive(Clone, Default)]
struct KindCallbacks {
    add: Option<Callback>,
    update: Option<Callback>,
    delete: Option<Callback>,
}

impl KindCallbacks {
    fn slot(&mut self, event_type: EventType) -> &mut Option<Callback> {
        match event_type {
            EventType::Add => &mut self.add,
            EventType::Update => &mut self.update,
            EventType::Delete => &mut self.delete,
        }
    }

    fn get(&self, event_type: EventType) -> Option<&Callback> {
        match event_type {
            EventType::Add => self.add.as_ref(),
            EventType::Update => self.update.as_ref(),
            EventType::Delete => self.delete.as_ref(),
        }
    }

    fn count(&self) -> usize {
        [&self.add, &self.update, &self.delete]
            .iter()
            .filter(|c| c.is_some())
            .count()
    }
}

/// Registry statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub kinds: usize,
    pub callbacks: usize,
}

/// Handler registry shared by a queue's workers.
#[derive(Default)]
pub struct HandlerRegistry {
    kinds: RwLock<HashMap<String, KindCallbacks>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `callback` with (kind, event type). The last registration wins.
    pub fn register(&self, kind: &str, event_type: EventType, callback: Callback) {
        let replaced = {
            let mut kinds = self.kinds.write();
            kinds
                .entry(kind.to_string())
                .or_default()
                .slot(event_type)
                .replace(callback)
                .is_some()
        };

        tracing::debug!(
            kind = kind,
            event_type = %event_type,
            replaced,
            "Registered handler callback"
        );
    }

    /// Resolve the callback for (kind, event type).
    ///
    /// Returns a clone so no lock is held while the callback runs.
    pub fn lookup(&self, kind: &str, event_type: EventType) -> Option<Callback> {
        self.kinds
            .read()
            .get(kind)
            .and_then(|callbacks| callbacks.get(event_type))
            .cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        let kinds = self.kinds.read();
        RegistryStats {
            kinds: kinds.len(),
            callbacks: kinds.values().map(KindCallbacks::count).sum(),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds = self.kinds.read();
        let mut names: Vec<&String> = kinds.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &names).finish()
    }
}
