//! Tracing/logging setup shared by the worker and the CLI.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::{LogFormat, init};
