//! HTTP middleware shared by every service binary.

pub mod metrics;
pub mod tracing;
