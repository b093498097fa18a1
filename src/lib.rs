//! Background upload-and-analysis pipeline for item images.
//!
//! A [`TaskStore`] holds every in-flight and recently finished task. The
//! [`UploadCoordinator`] writes to it as it drives each image through upload
//! and analysis, the [`ProgressNotifier`] renders it, and the
//! [`EditIntentResolver`] opens the editor for created items, tolerating the
//! delay before a new record becomes readable.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod notifier;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigError, ErrorSurfacing, PipelineConfig};
pub use coordinator::{UploadCoordinator, UploadHandle};
pub use error::{ErrorCategory, PipelineError, PipelineResult, ServiceError};
pub use model::{
    EditIntent, ItemId, ItemRecord, SourceFile, Task, TaskId, TaskPatch, TaskStatus,
    UploadMetadata, ValidationError,
};
pub use notifier::{NotifierHandle, ProgressNotifier};
pub use resolver::{
    edit_intent_channel, EditIntentReceiver, EditIntentResolver, EditIntentSender, ResolveError,
    Resolution,
};
pub use retry::{retry_with_backoff, retry_with_backoff_notify, Backoff, RetryPolicy};
pub use store::{
    IgnoreReason, StoreError, StoreEvent, Subscription, TaskChange, TaskStore, UpdateOutcome,
};
