//! CSV file sink.
//!
//! One file per collector, append-only. The header is written exactly once
//! per file lifetime: only when the file was empty at open. Every write is
//! flushed before returning so data is durable up to the OS page cache at
//! cycle granularity.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::CollectError;
use crate::sample::{LabelSet, MetricSet, Sample};

pub struct CsvSink<L, M> {
    path: PathBuf,
    writer: BufWriter<File>,
    last_error: Option<String>,
    _marker: PhantomData<fn() -> (L, M)>,
}

impl<L: LabelSet, M: MetricSet> CsvSink<L, M> {
    /// Opens (or creates) the file in append mode.
    ///
    /// A missing `.csv` extension is added and parent directories are
    /// created. Failing to open the file invalidates the collector, so this
    /// returns a fatal error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CollectError> {
        let mut path = path.as_ref().to_path_buf();
        if path.extension().map(|e| e != "csv").unwrap_or(true) {
            path.set_extension("csv");
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CollectError::fatal(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CollectError::fatal(format!("cannot open {}: {}", path.display(), e)))?;

        let empty = file
            .metadata()
            .map(|m| m.len() == 0)
            .map_err(|e| CollectError::fatal(format!("cannot stat {}: {}", path.display(), e)))?;

        let mut sink = Self {
            path,
            writer: BufWriter::new(file),
            last_error: None,
            _marker: PhantomData,
        };

        if empty {
            sink.write_header()?;
            info!(path = %sink.path.display(), "new csv file, header written");
        } else {
            debug!(path = %sink.path.display(), "appending to existing csv file");
        }

        Ok(sink)
    }

    fn write_header(&mut self) -> Result<(), CollectError> {
        let mut columns = vec!["Timestamp"];
        columns.extend_from_slice(L::COLUMNS);
        columns.extend_from_slice(M::FIELDS);
        writeln!(self.writer, "{}", columns.join(","))
            .and_then(|_| self.writer.flush())
            .map_err(|e| {
                CollectError::fatal(format!("cannot write {}: {}", self.path.display(), e))
            })
    }

    /// Appends one row per (label, metric) pair and flushes.
    ///
    /// Failures are the sink's own concern: logged, remembered, never
    /// propagated to the collector.
    pub fn write(&mut self, sample: &Sample<'_, L, M>) {
        let timestamp = sample.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        let result: std::io::Result<()> = sample
            .pairs()
            .try_for_each(|(label, metric)| {
                writeln!(self.writer, "{}", format_row(&timestamp, label, metric))
            })
            .and_then(|_| self.writer.flush());

        match result {
            Ok(()) => {
                self.last_error = None;
                debug!(path = %self.path.display(), rows = sample.labels.len(), "csv rows appended");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "csv write failed");
                self.last_error = Some(e.to_string());
            }
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_row<L: LabelSet, M: MetricSet>(timestamp: &str, label: &L, metric: &M) -> String {
    let mut fields = Vec::with_capacity(1 + L::COLUMNS.len() + M::FIELDS.len());
    fields.push(timestamp.to_string());
    for value in label.values() {
        fields.push(value.to_csv_field());
    }
    for value in metric.values() {
        // Absent values stay visible as an empty cell.
        fields.push(value.map(|v| v.to_string()).unwrap_or_default());
    }
    fields.join(",")
}
