//! Observability for clustergrade: tracing subscriber setup with a dated log
//! file and optional OpenTelemetry export.

pub mod tracing_setup;

pub use tracing_setup::{TracingGuard, init_tracing, shutdown_tracing};
