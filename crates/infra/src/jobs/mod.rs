//! Background task runner with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Every run of a task is its own invocation (`Job`)
//! - A failed invocation never sleeps; it enqueues a successor with `retries + 1`
//!   and an eta `2^retries` seconds out (60 s when rate-limited)
//! - After 11 retries the next failure is final and the invocation is dead-lettered
//!
//! ## Components
//!
//! - `Job` / `TaskKind`: an invocation and the task it runs
//! - `JobStore`: persistence for invocations and dead letters
//! - `JobExecutor`: claims invocations and applies the retry policy
//! - `TaskHandler`: the task bodies

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorError, JobExecutorHandle,
    TaskHandler,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    DeadLetterEntry, Job, JobId, JobStatus, RetryPolicy, TaskError, TaskKind, TaskOutcome,
    TaskResult,
};
