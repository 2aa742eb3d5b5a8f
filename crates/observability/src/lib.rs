//! Shared tracing setup for orderflow binaries.

pub use crate::tracing::{LogConfig, LogFormat, init};

/// Subscriber configuration and installation.
pub mod tracing;
