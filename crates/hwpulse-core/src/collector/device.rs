//! Generic collector over a probe plus configured sinks.

use chrono::{DateTime, Local};
use prometheus::Registry;
use std::path::Path;
use tracing::{debug, warn};

use crate::collector::{Collector, Probe};
use crate::error::CollectError;
use crate::sample::Sample;
use crate::sink::{ConnectionConfig, ConsoleSink, CsvSink, DatabaseSink, GaugeSink};

/// Owns one probe, its established label list, and 0..N sink handles.
///
/// Sinks are toggled independently through the builder methods and written
/// in a fixed order each cycle: console, CSV, gauges, database. A failure
/// inside a sink stays inside that sink; the remaining sinks still receive
/// the sample.
pub struct DeviceCollector<P: Probe> {
    probe: P,
    labels: Vec<P::Label>,
    console: Option<ConsoleSink>,
    csv: Option<CsvSink<P::Label, P::Metric>>,
    gauges: Option<GaugeSink<P::Label, P::Metric>>,
    database: Option<DatabaseSink<P::Label, P::Metric>>,
}

impl<P: Probe> DeviceCollector<P> {
    /// Discovers the probe's label topology and wraps it with no sinks.
    ///
    /// An empty topology means the source has nothing to monitor, which
    /// invalidates the collector.
    pub fn new(mut probe: P) -> Result<Self, CollectError> {
        let labels = probe.labels()?;
        if labels.is_empty() {
            return Err(CollectError::fatal(format!(
                "{}: no devices discovered",
                probe.name()
            )));
        }
        Ok(Self {
            probe,
            labels,
            console: None,
            csv: None,
            gauges: None,
            database: None,
        })
    }

    pub fn with_console(mut self) -> Self {
        self.console = Some(ConsoleSink::new());
        self
    }

    pub fn with_csv(mut self, path: impl AsRef<Path>) -> Result<Self, CollectError> {
        self.csv = Some(CsvSink::open(path)?);
        Ok(self)
    }

    pub fn with_gauges(mut self, registry: &Registry, prefix: &str) -> Result<Self, CollectError> {
        self.gauges = Some(GaugeSink::register(registry, prefix)?);
        Ok(self)
    }

    /// Attaches a database sink. The first connect attempt happens here so
    /// a misconfigured database shows up in the logs at startup, but a
    /// failure only defers the connection: the sink repairs itself on a
    /// later cycle.
    pub fn with_database(mut self, config: ConnectionConfig, table_prefix: &str) -> Self {
        let mut sink = DatabaseSink::new(config, table_prefix);
        if !sink.ensure_connection() {
            warn!(
                collector = %self.probe.name(),
                error = sink.last_error().unwrap_or("unknown"),
                "database unavailable at startup, will retry each cycle"
            );
        }
        self.database = Some(sink);
        self
    }

    /// Number of monitored entities, for logging.
    pub fn device_count(&self) -> usize {
        self.labels.len()
    }
}

impl<P: Probe> Collector for DeviceCollector<P> {
    fn name(&self) -> String {
        self.probe.name()
    }

    fn collect(&mut self, now: DateTime<Local>) -> Result<(), CollectError> {
        let metrics = self.probe.sample(&self.labels)?;
        let sample = Sample::new(now, &self.labels, &metrics);

        if let Some(sink) = self.console.as_mut() {
            sink.write(&sample);
        }
        if let Some(sink) = self.csv.as_mut() {
            sink.write(&sample);
        }
        if let Some(sink) = self.gauges.as_mut() {
            sink.write(&sample);
        }
        if let Some(sink) = self.database.as_mut() {
            sink.write_metrics(&sample);
        }

        debug!(collector = %self.probe.name(), devices = self.labels.len(), "sample fanned out");
        Ok(())
    }
}
