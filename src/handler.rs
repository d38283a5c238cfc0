//! Pluggable business logic.
//!
//! A [`Handler`] reacts to changes of one kind of resource. Concrete
//! handlers embed a [`DefaultHandler`] for the informer wiring and override
//! only the callbacks they care about; the rest are no-ops.
//!
//! ```ignore
//! #[derive(Debug)]
//! struct PodLogger {
//!     base: DefaultHandler,
//! }
//!
//! #[async_trait]
//! impl Handler for PodLogger {
//!     fn name(&self) -> &str {
//!         "PodLogger"
//!     }
//!
//!     fn base(&self) -> Option<&DefaultHandler> {
//!         Some(&self.base)
//!     }
//!
//!     async fn on_add(&self, namespace: &str, name: &str) -> HandlerResult {
//!         tracing::info!("Pod {} added in namespace {}", name, namespace);
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::informer::Informer;
use crate::types::HandlerResult;

/// Cache-populated check.
pub type SyncPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

#[async_trait]
pub trait Handler: Send + Sync + fmt::Debug {
    /// Handler name; also the default kind.
    fn name(&self) -> &str;

    /// Kind the handler's callbacks are registered under.
    fn kind(&self) -> &str {
        self.name()
    }

    async fn on_add(&self, _namespace: &str, _name: &str) -> HandlerResult {
        Ok(())
    }

    async fn on_update(&self, _namespace: &str, _name: &str) -> HandlerResult {
        Ok(())
    }

    async fn on_delete(&self, _namespace: &str, _name: &str) -> HandlerResult {
        Ok(())
    }

    /// Shared informer wiring, if the handler embeds it.
    fn base(&self) -> Option<&DefaultHandler> {
        None
    }

    /// Whether the handler's cache is populated. Handlers without a base
    /// are always synced.
    fn has_synced(&self) -> bool {
        self.base().map_or(true, DefaultHandler::has_synced)
    }

    fn informer(&self) -> Option<Arc<dyn Informer>> {
        self.base().and_then(DefaultHandler::informer)
    }
}

/// Informer reference and sync predicate shared by concrete handlers.
#[derive(Clone, Default)]
pub struct DefaultHandler {
    informer: Option<Arc<dyn Informer>>,
    synced: Option<SyncPredicate>,
}

impl DefaultHandler {
    /// Wire a handler to `informer`; has-synced passes through to it.
    pub fn new(informer: Arc<dyn Informer>) -> Self {
        Self {
            informer: Some(informer),
            synced: None,
        }
    }

    /// Override the sync predicate.
    pub fn with_synced<F>(mut self, synced: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.synced = Some(Arc::new(synced));
        self
    }

    pub fn has_synced(&self) -> bool {
        match (&self.synced, &self.informer) {
            (Some(synced), _) => synced(),
            (None, Some(informer)) => informer.has_synced(),
            (None, None) => true,
        }
    }

    pub fn informer(&self) -> Option<Arc<dyn Informer>> {
        self.informer.clone()
    }
}

impl fmt::Debug for DefaultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultHandler")
            .field("informer", &self.informer)
            .field("custom_synced", &self.synced.is_some())
            .finish()
    }
}
