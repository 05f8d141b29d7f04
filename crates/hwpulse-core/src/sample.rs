//! Label/metric snapshot model.
//!
//! A `LabelSet` is the static identity of one monitored entity (a CPU
//! package, a host, a cluster). A `MetricSet` is one flat measurement record
//! for one entity at one instant. A [`Sample`] pairs them positionally:
//! `metrics[i]` describes `labels[i]`, and every sink receives the pair
//! under that invariant.
//!
//! A field that could not be read this cycle is `None`, never a sentinel
//! number; sinks render absence explicitly (empty CSV cell, SQL NULL).

use chrono::{DateTime, Local};

/// One identity field value.
///
/// Carries enough type information for the database sink to derive column
/// types and for the CSV sink to quote free-text fields.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    Int(i64),
    Text(String),
}

impl LabelValue {
    /// SQL column type for this kind of value.
    pub fn sql_type(&self) -> &'static str {
        match self {
            LabelValue::Int(_) => "BIGINT",
            LabelValue::Text(_) => "TEXT",
        }
    }

    /// Renders the value as a CSV field, quoting free text that would
    /// otherwise break the row format.
    pub fn to_csv_field(&self) -> String {
        match self {
            LabelValue::Int(v) => v.to_string(),
            LabelValue::Text(s) => {
                if s.contains(',') || s.contains('"') || s.contains('\n') {
                    format!("\"{}\"", s.replace('"', "\"\""))
                } else {
                    s.clone()
                }
            }
        }
    }
}

impl std::fmt::Display for LabelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelValue::Int(v) => write!(f, "{}", v),
            LabelValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Static identity of one monitored entity.
///
/// The column list is fixed per entity family; `KEY` names the subset that
/// identifies an entity across cycles (the database sink upserts on it).
pub trait LabelSet {
    const COLUMNS: &'static [&'static str];
    const KEY: &'static [&'static str];

    /// Field values, positionally matching `COLUMNS`.
    fn values(&self) -> Vec<LabelValue>;
}

/// One measurement record produced for one label at one instant.
///
/// `None` means the field was unavailable this cycle; it is forwarded to
/// every sink, not dropped.
pub trait MetricSet {
    const FIELDS: &'static [&'static str];

    /// Field values, positionally matching `FIELDS`.
    fn values(&self) -> Vec<Option<f64>>;
}

/// A positionally paired snapshot delivered to sinks.
pub struct Sample<'a, L, M> {
    pub timestamp: DateTime<Local>,
    pub labels: &'a [L],
    pub metrics: &'a [M],
}

impl<'a, L: LabelSet, M: MetricSet> Sample<'a, L, M> {
    /// Builds a sample, enforcing positional correspondence.
    ///
    /// A length mismatch is a programming error in the probe, not a runtime
    /// condition, so it panics rather than returning an error.
    pub fn new(timestamp: DateTime<Local>, labels: &'a [L], metrics: &'a [M]) -> Self {
        assert_eq!(
            labels.len(),
            metrics.len(),
            "probe returned {} metrics for {} labels",
            metrics.len(),
            labels.len()
        );
        Self {
            timestamp,
            labels,
            metrics,
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&'a L, &'a M)> {
        self.labels.iter().zip(self.metrics.iter())
    }
}
