//! Change-source seam.
//!
//! The engine does not watch anything itself. An [`Informer`] is whatever
//! keeps a local cache of some resource and reports changes to registered
//! [`ResourceEventHandler`]s; the event loop subscribes an adapter that turns
//! those notifications into queue items.
//!
//! [`MemoryInformer`] is a map-backed informer for tests, demos and
//! embedding the engine without a real watch.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::{Object, ObjectKey, Result};

/// Receiver of change notifications.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &dyn Object);
    fn on_update(&self, old: &dyn Object, new: &dyn Object);
    fn on_delete(&self, obj: &dyn Object);
}

/// A watched, locally cached resource collection.
pub trait Informer: Send + Sync + fmt::Debug {
    /// True once the initial listing has been loaded into the cache.
    fn has_synced(&self) -> bool;

    /// Subscribe `handler` to future changes.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>);
}

// =============================================================================
// MemoryInformer
// =============================================================================

/// Informer over an in-memory map of JSON objects.
///
/// Handlers are called synchronously on the mutating thread, after the
/// cache has been updated and with no lock held.
#[derive(Default)]
pub struct MemoryInformer {
    objects: RwLock<BTreeMap<ObjectKey, serde_json::Value>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler>>>,
    synced: AtomicBool,
}

impl MemoryInformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the initial listing complete.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Insert or replace an object, notifying add or update.
    pub fn upsert(&self, obj: serde_json::Value) -> Result<ObjectKey> {
        let key = obj.object_key()?;
        let previous = self.objects.write().insert(key.clone(), obj.clone());

        for handler in self.snapshot_handlers() {
            match &previous {
                Some(old) => handler.on_update(old, &obj),
                None => handler.on_add(&obj),
            }
        }
        Ok(key)
    }

    /// Remove an object, notifying delete. Returns the removed object.
    pub fn remove(&self, key: &ObjectKey) -> Option<serde_json::Value> {
        let removed = self.objects.write().remove(key)?;
        for handler in self.snapshot_handlers() {
            handler.on_delete(&removed);
        }
        Some(removed)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<serde_json::Value> {
        self.objects.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<serde_json::Value> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn snapshot_handlers(&self) -> Vec<Arc<dyn ResourceEventHandler>> {
        self.handlers.read().clone()
    }
}

impl Informer for MemoryInformer {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Late subscribers are replayed the current contents as adds. An object
    /// upserted concurrently may be delivered twice, never missed.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        let existing: Vec<serde_json::Value> = {
            let mut handlers = self.handlers.write();
            let existing = self.list();
            handlers.push(handler.clone());
            existing
        };
        for obj in &existing {
            handler.on_add(obj);
        }
    }
}

impl fmt::Debug for MemoryInformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryInformer")
            .field("objects", &self.objects.read().len())
            .field("handlers", &self.handlers.read().len())
            .field("synced", &self.has_synced())
            .finish()
    }
}
