//! Time-series registry sink.
//!
//! One gauge family per metric field, labeled by the entity's identity
//! columns. Semantics are last-write-wins per label set; an absent value
//! leaves the previously exported value in place.

use std::marker::PhantomData;

use prometheus::{GaugeVec, Opts, Registry};

use crate::error::CollectError;
use crate::sample::{LabelSet, MetricSet, Sample};

pub struct GaugeSink<L, M> {
    // Aligned with M::FIELDS.
    families: Vec<GaugeVec>,
    _marker: PhantomData<fn() -> (L, M)>,
}

impl<L: LabelSet, M: MetricSet> GaugeSink<L, M> {
    /// Registers one gauge family per metric field under the given prefix.
    ///
    /// Registration conflicts mean the collector was wired twice, which is a
    /// configuration error, so this is fatal.
    pub fn register(registry: &Registry, prefix: &str) -> Result<Self, CollectError> {
        let mut families = Vec::with_capacity(M::FIELDS.len());
        for field in M::FIELDS {
            let opts = Opts::new(
                format!("{}_{}", prefix, field),
                format!("{} reported by the {} collector", field, prefix),
            );
            let family = GaugeVec::new(opts, L::COLUMNS)
                .map_err(|e| CollectError::fatal(format!("gauge family {}: {}", field, e)))?;
            registry
                .register(Box::new(family.clone()))
                .map_err(|e| CollectError::fatal(format!("register {}: {}", field, e)))?;
            families.push(family);
        }
        Ok(Self {
            families,
            _marker: PhantomData,
        })
    }

    pub fn write(&mut self, sample: &Sample<'_, L, M>) {
        for (label, metric) in sample.pairs() {
            let values: Vec<String> = label.values().iter().map(|v| v.to_string()).collect();
            let label_refs: Vec<&str> = values.iter().map(|s| s.as_str()).collect();
            for (family, value) in self.families.iter().zip(metric.values()) {
                if let Some(v) = value {
                    family.with_label_values(&label_refs).set(v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::LabelValue;
    use chrono::Local;

    struct PkgLabel {
        package: i64,
    }

    impl LabelSet for PkgLabel {
        const COLUMNS: &'static [&'static str] = &["package"];
        const KEY: &'static [&'static str] = &["package"];

        fn values(&self) -> Vec<LabelValue> {
            vec![LabelValue::Int(self.package)]
        }
    }

    struct PowerMetric {
        watts: Option<f64>,
    }

    impl MetricSet for PowerMetric {
        const FIELDS: &'static [&'static str] = &["watts"];

        fn values(&self) -> Vec<Option<f64>> {
            vec![self.watts]
        }
    }

    fn gathered_value(registry: &Registry, name: &str, label: (&str, &str)) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|f| f.get_name() == name)?
            .get_metric()
            .iter()
            .find(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == label.0 && l.get_value() == label.1)
            })
            .map(|m| m.get_gauge().get_value())
    }

    #[test]
    fn set_semantics_are_last_write_wins() {
        let registry = Registry::new();
        let mut sink: GaugeSink<PkgLabel, PowerMetric> =
            GaugeSink::register(&registry, "cpu").unwrap();

        let labels = vec![PkgLabel { package: 0 }];
        for watts in [10.0, 42.5] {
            let metrics = vec![PowerMetric { watts: Some(watts) }];
            sink.write(&Sample::new(Local::now(), &labels, &metrics));
        }

        assert_eq!(
            gathered_value(&registry, "cpu_watts", ("package", "0")),
            Some(42.5)
        );
    }

    #[test]
    fn absent_value_keeps_previous_export() {
        let registry = Registry::new();
        let mut sink: GaugeSink<PkgLabel, PowerMetric> =
            GaugeSink::register(&registry, "cpu").unwrap();

        let labels = vec![PkgLabel { package: 1 }];
        let metrics = vec![PowerMetric { watts: Some(7.0) }];
        sink.write(&Sample::new(Local::now(), &labels, &metrics));
        let metrics = vec![PowerMetric { watts: None }];
        sink.write(&Sample::new(Local::now(), &labels, &metrics));

        assert_eq!(
            gathered_value(&registry, "cpu_watts", ("package", "1")),
            Some(7.0)
        );
    }

    #[test]
    fn double_registration_is_fatal() {
        let registry = Registry::new();
        let first: Result<GaugeSink<PkgLabel, PowerMetric>, _> =
            GaugeSink::register(&registry, "cpu");
        assert!(first.is_ok());

        let second: Result<GaugeSink<PkgLabel, PowerMetric>, _> =
            GaugeSink::register(&registry, "cpu");
        assert!(matches!(second, Err(CollectError::Fatal(_))));
    }
}
