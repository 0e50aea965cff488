//! In-memory async job scheduler for WebIntel.
//!
//! This crate provides:
//! - [`Job`]: a unit of async work with attempt counting, fixed-backoff
//!   retries, cancellation and lifecycle hooks
//! - [`SchedulerEngine`]: a heap-ordered engine for delayed and recurring jobs
//!   with cooperative cancellation

mod engine;
mod error;
mod hooks;
mod job;

pub use engine::SchedulerEngine;
pub use error::{HandlerError, JobError};
pub use hooks::{JobHooks, NoopHooks};
pub use job::{Job, JobFuture, JobHandler, JobSnapshot, JobState, Runnable};
