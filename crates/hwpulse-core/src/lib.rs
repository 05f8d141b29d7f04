//! hwpulse-core - hardware telemetry collection pipeline.
//!
//! Provides the building blocks of the hwpulsed daemon:
//!
//! - a positional label/metric snapshot model ([`sample`])
//! - the [`collector::Collector`] contract and concrete probes over
//!   `/proc`, `/sys` and a Redis-backed cluster link
//! - delta/rate sampling with stuck-counter self-healing ([`delta`])
//! - independently toggled export sinks: terminal, CSV, Prometheus
//!   registry, PostgreSQL ([`sink`])
//! - the fixed-interval [`scheduler::Scheduler`] with per-collector
//!   error isolation

pub mod collector;
pub mod delta;
pub mod error;
pub mod sample;
pub mod scheduler;
pub mod sink;

pub use error::CollectError;
