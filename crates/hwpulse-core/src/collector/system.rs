//! Host-level probe: memory, disk and network throughput, machine power.
//!
//! Disk and network rates are diffed per device against the previous cycle;
//! baselines are replaced wholesale so a device that disappears simply stops
//! contributing. Machine power can come from an external command (ipmitool
//! or similar), which is slow and jittery, so it runs on its own worker
//! thread and the sampling path only reads an atomically cached value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collector::Probe;
use crate::collector::traits::FileSystem;
use crate::delta::{DeltaState, counter_delta, rate};
use crate::error::CollectError;
use crate::sample::{LabelSet, LabelValue, MetricSet};

/// How often the power worker refreshes its reading.
const POWER_REFRESH: Duration = Duration::from_secs(5);

/// Slice used for shutdown-aware sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SysLabel {
    pub host: String,
}

impl LabelSet for SysLabel {
    const COLUMNS: &'static [&'static str] = &["host"];
    const KEY: &'static [&'static str] = &["host"];

    fn values(&self) -> Vec<LabelValue> {
        vec![LabelValue::Text(self.host.clone())]
    }
}

#[derive(Debug, Clone, Default)]
pub struct SysMetrics {
    pub mem_total_gb: Option<f64>,
    pub mem_used_gb: Option<f64>,
    pub mem_util_pct: Option<f64>,
    pub disk_read_mbps: Option<f64>,
    pub disk_write_mbps: Option<f64>,
    pub disk_busy_pct: Option<f64>,
    pub net_rx_mbps: Option<f64>,
    pub net_tx_mbps: Option<f64>,
    pub power_watts: Option<f64>,
}

impl MetricSet for SysMetrics {
    const FIELDS: &'static [&'static str] = &[
        "mem_total_gb",
        "mem_used_gb",
        "mem_util_pct",
        "disk_read_mbps",
        "disk_write_mbps",
        "disk_busy_pct",
        "net_rx_mbps",
        "net_tx_mbps",
        "power_watts",
    ];

    fn values(&self) -> Vec<Option<f64>> {
        vec![
            self.mem_total_gb,
            self.mem_used_gb,
            self.mem_util_pct,
            self.disk_read_mbps,
            self.disk_write_mbps,
            self.disk_busy_pct,
            self.net_rx_mbps,
            self.net_tx_mbps,
            self.power_watts,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DiskCounters {
    sectors_read: u64,
    sectors_written: u64,
    io_ticks_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct NetCounters {
    rx_bytes: u64,
    tx_bytes: u64,
}

#[derive(Debug, Clone, Default)]
struct SysCounters {
    disks: HashMap<String, DiskCounters>,
    nets: HashMap<String, NetCounters>,
}

pub struct SystemProbe<F: FileSystem> {
    fs: F,
    meminfo_path: PathBuf,
    diskstats_path: PathBuf,
    netdev_path: PathBuf,
    state: DeltaState<SysCounters>,
    power: Option<PowerWorker>,
}

impl<F: FileSystem> SystemProbe<F> {
    /// Checks the proc files are readable, primes the delta baseline, and
    /// starts the power worker when a command is configured.
    pub fn new(
        fs: F,
        proc_path: impl AsRef<Path>,
        power_cmd: Option<String>,
    ) -> Result<Self, CollectError> {
        let proc_path = proc_path.as_ref();
        let meminfo_path = proc_path.join("meminfo");
        let diskstats_path = proc_path.join("diskstats");
        let netdev_path = proc_path.join("net/dev");

        // A host without these files cannot be monitored at all.
        fs.read_to_string(&meminfo_path).map_err(|e| {
            CollectError::fatal(format!("cannot read {}: {}", meminfo_path.display(), e))
        })?;

        let baseline = read_sys_counters(&fs, &diskstats_path, &netdev_path);
        let power = power_cmd.map(PowerWorker::spawn);

        Ok(Self {
            fs,
            meminfo_path,
            diskstats_path,
            netdev_path,
            state: DeltaState::new(baseline),
            power,
        })
    }
}

impl<F: FileSystem> Probe for SystemProbe<F> {
    type Label = SysLabel;
    type Metric = SysMetrics;

    fn name(&self) -> String {
        "system".to_string()
    }

    fn labels(&mut self) -> Result<Vec<SysLabel>, CollectError> {
        Ok(vec![SysLabel {
            host: "localhost".to_string(),
        }])
    }

    fn sample(&mut self, labels: &[SysLabel]) -> Result<Vec<SysMetrics>, CollectError> {
        let counters = read_sys_counters(&self.fs, &self.diskstats_path, &self.netdev_path);
        let (before, elapsed) = self.state.advance(counters.clone());

        let mut metrics = SysMetrics::default();

        match self.fs.read_to_string(&self.meminfo_path) {
            Ok(content) => fill_memory(&mut metrics, &content),
            Err(e) => warn!(error = %e, "memory collection failed"),
        }
        fill_disk(&mut metrics, &before.disks, &counters.disks, elapsed);
        fill_net(&mut metrics, &before.nets, &counters.nets, elapsed);
        metrics.power_watts = self.power.as_ref().and_then(|w| w.watts());

        debug!(
            disks = counters.disks.len(),
            interfaces = counters.nets.len(),
            "system sampled"
        );
        Ok(labels.iter().map(|_| metrics.clone()).collect())
    }
}

/// Background reader for a slow external power command.
///
/// The worker owns the subprocess calls; the sampling path never blocks on
/// them, it only loads the cached value. Errors are logged and the previous
/// reading is kept, so a flaky BMC degrades to stale data, not to a stalled
/// scheduler.
struct PowerWorker {
    /// f64 bits; NaN means no successful reading yet.
    watts: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PowerWorker {
    fn spawn(command: String) -> Self {
        let watts = Arc::new(AtomicU64::new(f64::NAN.to_bits()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_watts = Arc::clone(&watts);
        let thread_stop = Arc::clone(&stop);
        info!(command = %command, "power worker started");
        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                match run_power_command(&command) {
                    Some(value) if value > 0.0 => {
                        thread_watts.store(value.to_bits(), Ordering::Relaxed);
                    }
                    _ => warn!(command = %command, "power reading failed"),
                }
                let mut remaining = POWER_REFRESH;
                while remaining > Duration::ZERO && !thread_stop.load(Ordering::Relaxed) {
                    let slice = remaining.min(SLEEP_SLICE);
                    std::thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
        });

        Self {
            watts,
            stop,
            handle: Some(handle),
        }
    }

    fn watts(&self) -> Option<f64> {
        let value = f64::from_bits(self.watts.load(Ordering::Relaxed));
        (!value.is_nan()).then_some(value)
    }
}

impl Drop for PowerWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_power_command(command: &str) -> Option<f64> {
    let output = Command::new("sh").arg("-c").arg(command).output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_watts(&String::from_utf8_lossy(&output.stdout))
}

/// Extracts the first positive number from command output. Handles both the
/// DCMI phrasing ("Instantaneous power reading: 123 Watts") and CSV sensor
/// lines ("Pwr Consumption,123,Watts,ok").
fn parse_watts(output: &str) -> Option<f64> {
    output
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .filter_map(|token| token.trim().parse::<f64>().ok())
        .find(|v| *v > 0.0)
}

fn read_sys_counters<F: FileSystem>(
    fs: &F,
    diskstats_path: &Path,
    netdev_path: &Path,
) -> SysCounters {
    let disks = match fs.read_to_string(diskstats_path) {
        Ok(content) => parse_diskstats(&content),
        Err(e) => {
            warn!(error = %e, "diskstats read failed");
            HashMap::new()
        }
    };
    let nets = match fs.read_to_string(netdev_path) {
        Ok(content) => parse_netdev(&content),
        Err(e) => {
            warn!(error = %e, "netdev read failed");
            HashMap::new()
        }
    };
    SysCounters { disks, nets }
}

fn fill_memory(metrics: &mut SysMetrics, content: &str) {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("MemTotal:"), Some(v)) => total_kb = v.parse::<u64>().ok(),
            (Some("MemAvailable:"), Some(v)) => available_kb = v.parse::<u64>().ok(),
            _ => {}
        }
    }

    if let (Some(total), Some(available)) = (total_kb, available_kb)
        && total > 0
    {
        let used = total.saturating_sub(available);
        metrics.mem_total_gb = Some(total as f64 / 1024.0 / 1024.0);
        metrics.mem_used_gb = Some(used as f64 / 1024.0 / 1024.0);
        metrics.mem_util_pct = Some(used as f64 / total as f64 * 100.0);
    } else {
        warn!("memory collection failed");
    }
}

fn fill_disk(
    metrics: &mut SysMetrics,
    before: &HashMap<String, DiskCounters>,
    after: &HashMap<String, DiskCounters>,
    elapsed: f64,
) {
    let mut read_bytes = 0.0;
    let mut write_bytes = 0.0;
    let mut max_busy: f64 = 0.0;
    let mut seen = false;

    for (name, current) in after {
        let Some(previous) = before.get(name) else {
            continue;
        };
        let (Some(r), Some(w), Some(busy_ms)) = (
            counter_delta(current.sectors_read, previous.sectors_read),
            counter_delta(current.sectors_written, previous.sectors_written),
            counter_delta(current.io_ticks_ms, previous.io_ticks_ms),
        ) else {
            // Counter reset (device re-attached); skip this device for one cycle.
            continue;
        };
        seen = true;
        read_bytes += r as f64 * 512.0;
        write_bytes += w as f64 * 512.0;
        max_busy = max_busy.max(busy_ms as f64 / (elapsed * 1000.0) * 100.0);
    }

    if seen {
        metrics.disk_read_mbps = Some(rate(read_bytes, elapsed) / 1024.0 / 1024.0);
        metrics.disk_write_mbps = Some(rate(write_bytes, elapsed) / 1024.0 / 1024.0);
        metrics.disk_busy_pct = Some(max_busy.min(100.0));
    }
}

fn fill_net(
    metrics: &mut SysMetrics,
    before: &HashMap<String, NetCounters>,
    after: &HashMap<String, NetCounters>,
    elapsed: f64,
) {
    let mut rx_bytes = 0.0;
    let mut tx_bytes = 0.0;
    let mut seen = false;

    for (name, current) in after {
        let Some(previous) = before.get(name) else {
            continue;
        };
        let (Some(rx), Some(tx)) = (
            counter_delta(current.rx_bytes, previous.rx_bytes),
            counter_delta(current.tx_bytes, previous.tx_bytes),
        ) else {
            continue;
        };
        seen = true;
        rx_bytes += rx as f64;
        tx_bytes += tx as f64;
    }

    if seen {
        metrics.net_rx_mbps = Some(rate(rx_bytes, elapsed) / 1024.0 / 1024.0);
        metrics.net_tx_mbps = Some(rate(tx_bytes, elapsed) / 1024.0 / 1024.0);
    }
}

/// Keeps whole physical disks: filters loopbacks, ramdisks, optical drives,
/// device-mapper volumes and partitions.
fn is_physical_disk(name: &str) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("sr") {
        return false;
    }
    if name.starts_with("dm-") {
        return false;
    }
    if (name.starts_with("sd") || name.starts_with("vd"))
        && name.chars().last().is_some_and(|c| c.is_ascii_digit())
    {
        return false;
    }
    if name.starts_with("nvme") && name.contains('p') {
        return false;
    }
    true
}

fn parse_diskstats(content: &str) -> HashMap<String, DiskCounters> {
    let mut disks = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name + at least the kernel 4.18 stat columns.
        if fields.len() < 14 {
            continue;
        }
        let name = fields[2];
        if !is_physical_disk(name) {
            continue;
        }
        let parse = |i: usize| fields[i].parse::<u64>().ok();
        let (Some(sectors_read), Some(sectors_written), Some(io_ticks_ms)) =
            (parse(5), parse(9), parse(12))
        else {
            continue;
        };
        disks.insert(
            name.to_string(),
            DiskCounters {
                sectors_read,
                sectors_written,
                io_ticks_ms,
            },
        );
    }
    disks
}

fn parse_netdev(content: &str) -> HashMap<String, NetCounters> {
    let mut nets = HashMap::new();
    // First two lines are headers.
    for line in content.lines().skip(2) {
        let Some((name, stats)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        let fields: Vec<&str> = stats.split_whitespace().collect();
        if fields.len() < 16 {
            continue;
        }
        let (Ok(rx_bytes), Ok(tx_bytes)) = (fields[0].parse(), fields[8].parse()) else {
            continue;
        };
        nets.insert(name.to_string(), NetCounters { rx_bytes, tx_bytes });
    }
    nets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const PROC: &str = "/proc";

    fn diskstats_line(name: &str, r_sectors: u64, w_sectors: u64, io_ticks: u64) -> String {
        format!(
            "   8       0 {} 100 0 {} 500 200 0 {} 700 0 {} 900\n",
            name, r_sectors, w_sectors, io_ticks
        )
    }

    fn netdev_content(rx: u64, tx: u64) -> String {
        format!(
            "Inter-|   Receive                                                |  Transmit\n \
             face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 10 1 0 0 0 0 0 0 10 1 0 0 0 0 0 0\n\
  eth0: {} 10 0 0 0 0 0 0 {} 10 0 0 0 0 0 0\n",
            rx, tx
        )
    }

    fn fixture() -> MockFs {
        let fs = MockFs::new();
        fs.set_file(
            format!("{}/meminfo", PROC),
            "MemTotal:       16384000 kB\nMemFree:         2000000 kB\nMemAvailable:    8192000 kB\n",
        );
        fs.set_file(
            format!("{}/diskstats", PROC),
            diskstats_line("sda", 1000, 2000, 100),
        );
        fs.set_file(format!("{}/net/dev", PROC), netdev_content(1000, 2000));
        fs
    }

    #[test]
    fn missing_meminfo_is_fatal() {
        let fs = MockFs::new();
        let result = SystemProbe::new(fs, PROC, None);
        assert!(matches!(result, Err(CollectError::Fatal(_))));
    }

    #[test]
    fn memory_fields_from_meminfo() {
        let mut metrics = SysMetrics::default();
        fill_memory(
            &mut metrics,
            "MemTotal:       16384000 kB\nMemAvailable:    8192000 kB\n",
        );
        assert_eq!(metrics.mem_util_pct, Some(50.0));
        assert!((metrics.mem_total_gb.unwrap() - 15.625).abs() < 1e-9);
    }

    #[test]
    fn memory_parse_failure_leaves_fields_absent() {
        let mut metrics = SysMetrics::default();
        fill_memory(&mut metrics, "garbage\n");
        assert_eq!(metrics.mem_total_gb, None);
        assert_eq!(metrics.mem_util_pct, None);
    }

    #[test]
    fn disk_rates_from_sector_deltas() {
        let mut before = HashMap::new();
        before.insert(
            "sda".to_string(),
            DiskCounters {
                sectors_read: 0,
                sectors_written: 0,
                io_ticks_ms: 0,
            },
        );
        let mut after = HashMap::new();
        after.insert(
            "sda".to_string(),
            DiskCounters {
                sectors_read: 4096,
                sectors_written: 8192,
                io_ticks_ms: 1000,
            },
        );

        let mut metrics = SysMetrics::default();
        fill_disk(&mut metrics, &before, &after, 2.0);
        // 4096 sectors * 512 B over 2 s = 1 MiB/s.
        assert_eq!(metrics.disk_read_mbps, Some(1.0));
        assert_eq!(metrics.disk_write_mbps, Some(2.0));
        // 1000 ms of IO over 2000 ms of wall clock.
        assert_eq!(metrics.disk_busy_pct, Some(50.0));
    }

    #[test]
    fn disk_counter_regression_skips_device() {
        let mut before = HashMap::new();
        before.insert(
            "sda".to_string(),
            DiskCounters {
                sectors_read: 5000,
                sectors_written: 0,
                io_ticks_ms: 0,
            },
        );
        let mut after = HashMap::new();
        after.insert(
            "sda".to_string(),
            DiskCounters {
                sectors_read: 100,
                sectors_written: 10,
                io_ticks_ms: 10,
            },
        );

        let mut metrics = SysMetrics::default();
        fill_disk(&mut metrics, &before, &after, 1.0);
        assert_eq!(metrics.disk_read_mbps, None);
    }

    #[test]
    fn net_rates_exclude_loopback() {
        let nets = parse_netdev(&netdev_content(1000, 2000));
        assert!(nets.contains_key("eth0"));
        assert!(!nets.contains_key("lo"));
    }

    #[test]
    fn physical_disk_filter() {
        assert!(is_physical_disk("sda"));
        assert!(is_physical_disk("nvme0n1"));
        assert!(is_physical_disk("vdb"));
        assert!(!is_physical_disk("sda1"));
        assert!(!is_physical_disk("nvme0n1p2"));
        assert!(!is_physical_disk("loop0"));
        assert!(!is_physical_disk("ram1"));
        assert!(!is_physical_disk("sr0"));
        assert!(!is_physical_disk("dm-3"));
    }

    #[test]
    fn sample_reports_rates_between_cycles() {
        let fs = fixture();
        let mut probe = SystemProbe::new(fs.clone(), PROC, None).unwrap();
        let labels = probe.labels().unwrap();

        fs.set_file(
            format!("{}/diskstats", PROC),
            diskstats_line("sda", 3000, 4000, 200),
        );
        fs.set_file(format!("{}/net/dev", PROC), netdev_content(9000, 4000));

        let metrics = probe.sample(&labels).unwrap();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert!(m.disk_read_mbps.unwrap() > 0.0);
        assert!(m.net_rx_mbps.unwrap() > 0.0);
        assert_eq!(m.mem_util_pct, Some(50.0));
        // No power command configured.
        assert_eq!(m.power_watts, None);
    }

    #[test]
    fn watts_parser_handles_both_formats() {
        assert_eq!(
            parse_watts("Instantaneous power reading: 123 Watts"),
            Some(123.0)
        );
        assert_eq!(parse_watts("Pwr Consumption,276,Watts,ok"), Some(276.0));
        assert_eq!(parse_watts("na\n"), None);
    }

    #[test]
    fn power_worker_reports_cached_value_and_joins() {
        let worker = PowerWorker::spawn("echo 'reading: 42.5 Watts'".to_string());
        // Poll briefly until the first command execution lands.
        for _ in 0..50 {
            if worker.watts().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(worker.watts(), Some(42.5));
        drop(worker); // must not hang on join
    }
}
