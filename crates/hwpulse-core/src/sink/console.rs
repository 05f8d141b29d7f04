//! Terminal sink: one formatted line per (label, metric) pair.

use crate::sample::{LabelSet, MetricSet, Sample};

#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }

    pub fn write<L: LabelSet, M: MetricSet>(&mut self, sample: &Sample<'_, L, M>) {
        let timestamp = sample.timestamp.format("%Y-%m-%d %H:%M:%S");
        for (label, metric) in sample.pairs() {
            println!("{} {}", timestamp, format_pair(label, metric));
        }
    }
}

fn format_pair<L: LabelSet, M: MetricSet>(label: &L, metric: &M) -> String {
    let mut parts = Vec::with_capacity(L::COLUMNS.len() + M::FIELDS.len());
    for (column, value) in L::COLUMNS.iter().zip(label.values()) {
        parts.push(format!("{}={}", column, value));
    }
    for (field, value) in M::FIELDS.iter().zip(metric.values()) {
        match value {
            Some(v) => parts.push(format!("{}={:.3}", field, v)),
            None => parts.push(format!("{}=n/a", field)),
        }
    }
    parts.join(" ")
}
