//! Core types for the dispatch engine.
//!
//! This module provides foundational types used throughout the system:
//! - **Keys**: Work item identity (EventType, ObjectKey, WorkItem)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for event loops, queues and logging

mod config;
mod errors;
mod keys;

pub use config::{
    BucketConfig, Config, EventLoopConfig, ObservabilityConfig, QueueConfig, RetryConfig,
};
pub use errors::{BoxError, Error, HandlerResult, Result};
pub use keys::{DeletedFinalStateUnknown, EventType, ItemRef, Object, ObjectKey, WorkItem};
