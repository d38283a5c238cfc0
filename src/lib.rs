//! # kubehandler - Event Dispatch Engine for Resource Controllers
//!
//! Turns change notifications about watched resources into calls on
//! user-supplied handlers:
//! - Work queue with coalescing, per-object serialisation and rate-limited retry
//! - Handler abstraction keyed by resource kind, with default no-op callbacks
//! - Event loop that gates processing on informer cache sync
//! - Signal plumbing for graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//!   Informer ──notify──▶ ┌──────────────── EventLoop ────────────────┐
//!   (cache)              │  ┌───────────┐        ┌────────────────┐  │
//!                        │  │ WorkQueue │──get──▶│ worker 1..N    │  │
//!                        │  │ (dedup,   │◀─done──│ registry lookup│  │
//!                        │  │  parking) │        └───────┬────────┘  │
//!                        │  └───────────┘                │           │
//!                        └───────────────────────────────┼───────────┘
//!                                                        ▼
//!                                     Handler::on_add / on_update / on_delete
//! ```
//!
//! Items carry only `(kind, event type, namespace/name)`; handlers read the
//! current object from their own cache.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod event_loop;
pub mod handler;
pub mod informer;
pub mod queue;
pub mod signals;
pub mod types;

// Internal utilities
pub mod observability;

pub use event_loop::{EventLoop, LoopState};
pub use handler::{DefaultHandler, Handler};
pub use informer::{Informer, MemoryInformer, ResourceEventHandler};
pub use queue::{QueueStats, WorkQueue};
pub use signals::setup_signal_handler;
pub use types::{
    BoxError, Config, Error, EventType, HandlerResult, Object, ObjectKey, Result, WorkItem,
};
