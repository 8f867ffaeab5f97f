//! Cutout job execution.
//!
//! - [`JobQueue`]: fingerprint-keyed job table with bounded concurrency,
//!   retries and result caching.
//! - [`CutoutExecutor`]: one attempt at a job; [`ExtractingExecutor`] runs the
//!   bounds resolver and extractor and writes through a [`ResultStore`].
//! - [`CutoutService`]: parse, look up and submit.
//! - [`EventBus`]: lifecycle events for every status transition.

pub mod catalog;
pub mod config;
pub mod events;
pub mod executor;
pub mod queue;
pub mod retention;
pub mod service;
pub mod store;

pub use config::WorkerConfig;
pub use events::{EventBus, JobEvent};
pub use executor::{CutoutExecutor, ExtractingExecutor, JobSpec};
pub use queue::{JobHandle, JobQueue, JobSnapshot, QueueConfig};
pub use service::CutoutService;
pub use store::{FsResultStore, ResultRef, ResultStore};
