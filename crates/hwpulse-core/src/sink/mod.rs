//! Export sinks.
//!
//! A collector fans each sample out to every sink it was configured with,
//! in a fixed order. Sinks are independent: a write failure is logged and
//! remembered by the sink itself (`last_error`) and never surfaces as a
//! collector-level error, so a database outage cannot suppress the terminal
//! or CSV output.

pub mod console;
pub mod csv;
pub mod database;
pub mod gauge;

pub use console::ConsoleSink;
pub use csv::CsvSink;
pub use database::{ConnectionConfig, DatabaseSink};
pub use gauge::GaugeSink;
