//! HTTP middleware shared by the operational endpoints.

pub mod metrics;
pub mod tracing;
