//! CPU package power/utilization probe.
//!
//! Power comes from the kernel powercap interface: one
//! `/sys/class/powercap/intel-rapl:<n>/energy_uj` monotonic counter per
//! package, in microjoules, wrapping at `max_energy_range_uj`. Utilization
//! comes from the aggregate jiffy counters in `/proc/stat`. Both are
//! diffed against the previous cycle through a [`DeltaState`] baseline that
//! is primed at construction and replaced wholesale every cycle.
//!
//! Some RAPL driver revisions freeze the energy counters while the CPU
//! keeps executing. The probe watches for that signature — busy CPU, zero
//! watts everywhere — and after enough consecutive cycles rediscovers the
//! counter files and re-primes the baseline, exactly as at construction.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::collector::Probe;
use crate::collector::traits::FileSystem;
use crate::delta::{DeltaState, StuckCounterGuard, rate};
use crate::error::CollectError;
use crate::sample::{LabelSet, LabelValue, MetricSet};

/// Busy fraction above which the CPU counts as having a workload.
const WORKLOAD_THRESHOLD_PCT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct CpuLabel {
    pub package: i64,
    pub name: String,
}

impl LabelSet for CpuLabel {
    const COLUMNS: &'static [&'static str] = &["package", "name"];
    const KEY: &'static [&'static str] = &["package"];

    fn values(&self) -> Vec<LabelValue> {
        vec![
            LabelValue::Int(self.package),
            LabelValue::Text(self.name.clone()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct CpuPowerMetrics {
    /// Package power over the last cycle, watts.
    pub power_watts: Option<f64>,
    /// System-wide busy fraction over the last cycle, percent.
    pub busy_pct: Option<f64>,
    /// System-wide idle fraction over the last cycle, percent.
    pub idle_pct: Option<f64>,
}

impl MetricSet for CpuPowerMetrics {
    const FIELDS: &'static [&'static str] = &["power_watts", "busy_pct", "idle_pct"];

    fn values(&self) -> Vec<Option<f64>> {
        vec![self.power_watts, self.busy_pct, self.idle_pct]
    }
}

#[derive(Debug, Clone)]
struct RaplDomain {
    package: i64,
    name: String,
    energy_path: PathBuf,
    /// Counter wrap point, when the driver exposes it.
    max_energy_uj: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTicks {
    busy: u64,
    total: u64,
}

/// Raw counters of one cycle, positionally matching the domain list.
#[derive(Debug, Clone)]
struct CpuCounters {
    energy_uj: Vec<Option<u64>>,
    ticks: Option<CpuTicks>,
}

pub struct CpuPowerProbe<F: FileSystem> {
    fs: F,
    stat_path: PathBuf,
    powercap_path: PathBuf,
    domains: Vec<RaplDomain>,
    state: DeltaState<CpuCounters>,
    stuck: StuckCounterGuard,
    heal_count: u64,
}

impl<F: FileSystem> CpuPowerProbe<F> {
    /// Discovers the package domains and primes the delta baseline with one
    /// throwaway reading, so the first real cycle reports a sane rate.
    pub fn new(
        fs: F,
        proc_path: impl AsRef<Path>,
        powercap_path: impl AsRef<Path>,
    ) -> Result<Self, CollectError> {
        let stat_path = proc_path.as_ref().join("stat");
        let powercap_path = powercap_path.as_ref().to_path_buf();

        let domains = discover_domains(&fs, &powercap_path)?;
        let baseline = read_counters(&fs, &stat_path, &domains);
        Ok(Self {
            fs,
            stat_path,
            powercap_path,
            domains,
            state: DeltaState::new(baseline),
            stuck: StuckCounterGuard::new(),
            heal_count: 0,
        })
    }

    /// Times the probe has reset a stuck counter source.
    pub fn heal_count(&self) -> u64 {
        self.heal_count
    }

    /// Current zero-throughput streak, for tests and diagnostics.
    pub fn stuck_cycles(&self) -> u32 {
        self.stuck.zero_cycles()
    }

    /// Rediscovers the counter files and re-primes the baseline, exactly as
    /// at construction. The label list stays fixed; a topology change on a
    /// running system would be a hotplug event this probe does not model.
    fn reprogram(&mut self) {
        match discover_domains(&self.fs, &self.powercap_path) {
            Ok(domains) if domains.len() == self.domains.len() => {
                self.domains = domains;
            }
            Ok(domains) => {
                warn!(
                    before = self.domains.len(),
                    after = domains.len(),
                    "package count changed during counter reset, keeping old topology"
                );
            }
            Err(e) => {
                warn!(error = %e, "counter rediscovery failed, keeping old paths");
            }
        }
        let baseline = read_counters(&self.fs, &self.stat_path, &self.domains);
        self.state.reprime(baseline);
        self.heal_count += 1;
    }
}

impl<F: FileSystem> Probe for CpuPowerProbe<F> {
    type Label = CpuLabel;
    type Metric = CpuPowerMetrics;

    fn name(&self) -> String {
        "cpu_power".to_string()
    }

    fn labels(&mut self) -> Result<Vec<CpuLabel>, CollectError> {
        Ok(self
            .domains
            .iter()
            .map(|d| CpuLabel {
                package: d.package,
                name: d.name.clone(),
            })
            .collect())
    }

    fn sample(&mut self, labels: &[CpuLabel]) -> Result<Vec<CpuPowerMetrics>, CollectError> {
        let counters = read_counters(&self.fs, &self.stat_path, &self.domains);
        let (before, elapsed) = self.state.advance(counters.clone());

        let busy = busy_pct(before.ticks, counters.ticks);
        let idle = busy.map(|b| (100.0 - b).max(0.0));

        let mut metrics = Vec::with_capacity(labels.len());
        for (i, domain) in self.domains.iter().enumerate() {
            let watts = power_watts(
                before.energy_uj.get(i).copied().flatten(),
                counters.energy_uj.get(i).copied().flatten(),
                domain.max_energy_uj,
                elapsed,
            );
            metrics.push(CpuPowerMetrics {
                power_watts: watts,
                busy_pct: busy,
                idle_pct: idle,
            });
        }

        let workload_present = busy.map(|b| b > WORKLOAD_THRESHOLD_PCT).unwrap_or(false);
        let throughput_seen = metrics
            .iter()
            .any(|m| m.power_watts.map(|w| w > 0.0).unwrap_or(false));
        if self.stuck.observe(workload_present, throughput_seen) {
            warn!(
                packages = self.domains.len(),
                "energy counters stuck under load, resetting and re-priming"
            );
            self.reprogram();
        }

        debug!(packages = metrics.len(), "cpu power sampled");
        Ok(metrics)
    }
}

/// Finds the top-level `intel-rapl:<n>` package domains, skipping
/// subdomains like `intel-rapl:0:0`.
fn discover_domains<F: FileSystem>(
    fs: &F,
    powercap_path: &Path,
) -> Result<Vec<RaplDomain>, CollectError> {
    let entries = fs.read_dir(powercap_path).map_err(|e| {
        CollectError::fatal(format!(
            "powercap unavailable at {}: {}",
            powercap_path.display(),
            e
        ))
    })?;

    let mut domains = Vec::new();
    for entry in entries {
        let Some(file_name) = entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(suffix) = file_name.strip_prefix("intel-rapl:") else {
            continue;
        };
        let Ok(package) = suffix.parse::<i64>() else {
            // Subdomain or vendor extension.
            continue;
        };

        let name = fs
            .read_to_string(&entry.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| format!("package-{}", package));
        let max_energy_uj = fs
            .read_to_string(&entry.join("max_energy_range_uj"))
            .ok()
            .and_then(|s| s.trim().parse().ok());

        domains.push(RaplDomain {
            package,
            name,
            energy_path: entry.join("energy_uj"),
            max_energy_uj,
        });
    }

    if domains.is_empty() {
        return Err(CollectError::fatal(format!(
            "no rapl package domains under {}",
            powercap_path.display()
        )));
    }
    domains.sort_by_key(|d| d.package);
    Ok(domains)
}

/// Reads all raw counters for one cycle. A field that cannot be read is
/// `None` and logged; it never aborts the whole sample.
fn read_counters<F: FileSystem>(fs: &F, stat_path: &Path, domains: &[RaplDomain]) -> CpuCounters {
    let energy_uj = domains
        .iter()
        .map(|domain| {
            match fs
                .read_to_string(&domain.energy_path)
                .map_err(|e| e.to_string())
                .and_then(|s| s.trim().parse::<u64>().map_err(|e| e.to_string()))
            {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(package = domain.package, error = %e, "energy counter read failed");
                    None
                }
            }
        })
        .collect();

    let ticks = match fs.read_to_string(stat_path) {
        Ok(content) => parse_cpu_ticks(&content),
        Err(e) => {
            warn!(path = %stat_path.display(), error = %e, "cpu stat read failed");
            None
        }
    };

    CpuCounters { energy_uj, ticks }
}

/// Parses the aggregate `cpu` line of `/proc/stat` into busy/total jiffies.
/// Idle and iowait count as not busy.
fn parse_cpu_ticks(content: &str) -> Option<CpuTicks> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields[4];
    Some(CpuTicks {
        busy: total - idle,
        total,
    })
}

/// Power over the cycle from two energy readings, handling counter wrap
/// when the driver exposes the wrap point.
fn power_watts(
    before_uj: Option<u64>,
    after_uj: Option<u64>,
    max_energy_uj: Option<u64>,
    elapsed_secs: f64,
) -> Option<f64> {
    let before = before_uj?;
    let after = after_uj?;
    let delta_uj = if after >= before {
        after - before
    } else {
        // Counter wrapped at most once.
        let max = max_energy_uj?;
        max.checked_sub(before)? + after
    };
    Some(rate(delta_uj as f64 / 1e6, elapsed_secs))
}

/// Busy percentage between two tick snapshots.
fn busy_pct(before: Option<CpuTicks>, after: Option<CpuTicks>) -> Option<f64> {
    let before = before?;
    let after = after?;
    let total = after.total.checked_sub(before.total)?;
    if total == 0 {
        return None;
    }
    let busy = after.busy.checked_sub(before.busy)?;
    Some(busy as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const POWERCAP: &str = "/sys/class/powercap";
    const PROC: &str = "/proc";

    fn fixture(packages: usize) -> MockFs {
        let fs = MockFs::new();
        for p in 0..packages {
            let base = format!("{}/intel-rapl:{}", POWERCAP, p);
            fs.set_file(format!("{}/name", base), format!("package-{}\n", p));
            fs.set_file(format!("{}/energy_uj", base), "1000000\n");
            fs.set_file(
                format!("{}/max_energy_range_uj", base),
                "262143328850\n",
            );
            // A subdomain that must be skipped.
            fs.set_file(format!("{}/intel-rapl:{}:0/name", POWERCAP, p), "core\n");
        }
        fs.set_file(
            format!("{}/stat", PROC),
            "cpu  100 0 100 800 0 0 0 0 0 0\n",
        );
        fs
    }

    fn set_counters(fs: &MockFs, package: usize, energy_uj: u64, busy: u64, idle: u64) {
        fs.set_file(
            format!("{}/intel-rapl:{}/energy_uj", POWERCAP, package),
            format!("{}\n", energy_uj),
        );
        fs.set_file(
            format!("{}/stat", PROC),
            format!("cpu  {} 0 0 {} 0 0 0 0 0 0\n", busy, idle),
        );
    }

    #[test]
    fn discovers_package_domains_and_skips_subdomains() {
        let fs = fixture(2);
        let mut probe = CpuPowerProbe::new(fs, PROC, POWERCAP).unwrap();
        let labels = probe.labels().unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].package, 0);
        assert_eq!(labels[0].name, "package-0");
        assert_eq!(labels[1].package, 1);
    }

    #[test]
    fn missing_powercap_is_fatal() {
        let fs = MockFs::new();
        fs.set_file(format!("{}/stat", PROC), "cpu  1 0 0 1 0 0 0 0 0 0\n");
        let result = CpuPowerProbe::new(fs, PROC, POWERCAP);
        assert!(matches!(result, Err(CollectError::Fatal(_))));
    }

    #[test]
    fn power_rate_from_energy_delta() {
        // 20 J over 2 s is 10 W.
        assert_eq!(
            power_watts(Some(1_000_000), Some(21_000_000), None, 2.0),
            Some(10.0)
        );
    }

    #[test]
    fn power_handles_counter_wrap() {
        // 2 µJ left to the wrap point plus 8 µJ after it.
        let w = power_watts(Some(98), Some(8), Some(100), 1.0).unwrap();
        assert!((w - 10e-6).abs() < 1e-12);
        // Without a known wrap point a regression is unavailable, not negative.
        assert_eq!(power_watts(Some(98), Some(8), None, 1.0), None);
    }

    #[test]
    fn missing_energy_reading_yields_none() {
        let fs = fixture(1);
        let mut probe = CpuPowerProbe::new(fs.clone(), PROC, POWERCAP).unwrap();
        let labels = probe.labels().unwrap();

        fs.remove_file(format!("{}/intel-rapl:0/energy_uj", POWERCAP));
        fs.set_file(
            format!("{}/stat", PROC),
            "cpu  300 0 100 900 0 0 0 0 0 0\n",
        );
        let metrics = probe.sample(&labels).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].power_watts, None);
        // Utilization still present: one field failing never aborts the sample.
        assert!(metrics[0].busy_pct.is_some());
    }

    #[test]
    fn busy_pct_from_tick_deltas() {
        let before = CpuTicks {
            busy: 200,
            total: 1000,
        };
        let after = CpuTicks {
            busy: 500,
            total: 1400,
        };
        assert_eq!(busy_pct(Some(before), Some(after)), Some(75.0));
        assert_eq!(busy_pct(None, Some(after)), None);
    }

    #[test]
    fn stuck_counters_heal_after_threshold_cycles() {
        let fs = fixture(1);
        let mut probe = CpuPowerProbe::new(fs.clone(), PROC, POWERCAP).unwrap();
        let labels = probe.labels().unwrap();

        // Busy CPU, frozen energy counter: ticks advance, energy does not.
        let mut busy = 1000u64;
        for cycle in 0..crate::delta::STUCK_CYCLE_THRESHOLD {
            busy += 100;
            set_counters(&fs, 0, 1_000_000, busy, 800);
            let metrics = probe.sample(&labels).unwrap();
            assert_eq!(metrics[0].power_watts, Some(0.0));
            assert_eq!(probe.heal_count(), 0, "healed too early at cycle {}", cycle);
        }

        busy += 100;
        set_counters(&fs, 0, 1_000_000, busy, 800);
        probe.sample(&labels).unwrap();
        assert_eq!(probe.heal_count(), 1);
        assert_eq!(probe.stuck_cycles(), 0);
    }

    #[test]
    fn throughput_resets_the_stuck_streak() {
        let fs = fixture(1);
        let mut probe = CpuPowerProbe::new(fs.clone(), PROC, POWERCAP).unwrap();
        let labels = probe.labels().unwrap();

        let mut busy = 1000u64;
        for _ in 0..30 {
            busy += 100;
            set_counters(&fs, 0, 1_000_000, busy, 800);
            probe.sample(&labels).unwrap();
        }
        assert_eq!(probe.stuck_cycles(), 30);

        // The counter moves again: streak resets, no heal.
        busy += 100;
        set_counters(&fs, 0, 2_000_000, busy, 800);
        probe.sample(&labels).unwrap();
        assert_eq!(probe.stuck_cycles(), 0);
        assert_eq!(probe.heal_count(), 0);
    }
}
