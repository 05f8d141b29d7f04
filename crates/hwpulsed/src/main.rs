//! hwpulsed - hardware telemetry collection daemon.
//!
//! Polls CPU package power, host-level system metrics and cluster
//! membership on a fixed interval and fans every snapshot out to the
//! configured sinks: terminal, CSV files, a Prometheus gauge registry and
//! PostgreSQL tables.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use prometheus::Registry;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use hwpulse_core::collector::{
    ClusterConfig, ClusterProbe, Collector, CpuPowerProbe, DeviceCollector, RealFs, SystemProbe,
};
use hwpulse_core::error::CollectError;
use hwpulse_core::scheduler::Scheduler;
use hwpulse_core::sink::ConnectionConfig;

/// Hardware telemetry collection daemon.
#[derive(Parser)]
#[command(name = "hwpulsed", about = "Hardware telemetry collection daemon", version)]
struct Args {
    /// Collection interval in seconds.
    #[arg(short, long, default_value = "10")]
    interval: u64,

    /// Print each sample to the terminal. Disable with --console=false.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    console: bool,

    /// Directory for CSV output, one file per collector. CSV is disabled
    /// when not set.
    #[arg(long, value_name = "DIR")]
    csv_dir: Option<String>,

    /// Maintain a Prometheus gauge registry for all metrics.
    #[arg(long)]
    gauges: bool,

    /// Write metrics to PostgreSQL. Connection comes from the standard
    /// PG* environment variables.
    #[arg(long)]
    database: bool,

    /// Table name prefix for the database sink.
    #[arg(long, default_value = "hwpulse")]
    table_prefix: String,

    /// Enable the cluster collector (Redis link from REDIS_URL).
    #[arg(long)]
    cluster: bool,

    /// Node identifier advertised by the cluster heartbeat.
    #[arg(long, value_name = "ID")]
    node_id: Option<String>,

    /// Cluster heartbeat key expiry in seconds.
    #[arg(long, default_value = "5")]
    heartbeat_ttl: u64,

    /// Shell command that prints the machine power draw in watts
    /// (e.g. "ipmitool dcmi power reading"). Runs on a background thread.
    #[arg(long, value_name = "CMD")]
    power_cmd: Option<String>,

    /// Path to the proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Path to the powercap sysfs tree.
    #[arg(long, default_value = "/sys/class/powercap")]
    powercap_path: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("hwpulsed={}", level).parse().unwrap())
        .add_directive(format!("hwpulse_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

struct SinkOptions<'a> {
    console: bool,
    csv_dir: Option<&'a str>,
    registry: Option<&'a Registry>,
    database: Option<&'a ConnectionConfig>,
    table_prefix: &'a str,
}

/// Wires one probe into a collector with every enabled sink attached.
fn build_collector<P>(
    probe_result: Result<P, CollectError>,
    family: &str,
    sinks: &SinkOptions<'_>,
) -> Result<Box<dyn Collector>, CollectError>
where
    P: hwpulse_core::collector::Probe + 'static,
{
    let mut collector = DeviceCollector::new(probe_result?)?;
    if sinks.console {
        collector = collector.with_console();
    }
    if let Some(dir) = sinks.csv_dir {
        collector = collector.with_csv(Path::new(dir).join(family))?;
    }
    if let Some(registry) = sinks.registry {
        collector = collector.with_gauges(registry, family)?;
    }
    if let Some(config) = sinks.database {
        let prefix = format!("{}_{}", sinks.table_prefix, family);
        collector = collector.with_database(config.clone(), &prefix);
    }
    Ok(Box::new(collector))
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("hwpulsed {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, console={}, csv={}, gauges={}, database={}, cluster={}",
        args.interval,
        args.console,
        args.csv_dir.as_deref().unwrap_or("off"),
        args.gauges,
        args.database,
        args.cluster
    );

    let registry = args.gauges.then(Registry::new);
    let database = args.database.then(|| {
        let config = ConnectionConfig::from_env();
        info!(
            "Database sink: {}:{}/{}",
            config.host, config.port, config.dbname
        );
        config
    });

    let sinks = SinkOptions {
        console: args.console,
        csv_dir: args.csv_dir.as_deref(),
        registry: registry.as_ref(),
        database: database.as_ref(),
        table_prefix: &args.table_prefix,
    };

    // Shutdown flag, shared with the signal handler and the scheduler.
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut scheduler = Scheduler::new(Duration::from_secs(args.interval), running);

    scheduler.add_collector(build_collector(
        CpuPowerProbe::new(RealFs::new(), &args.proc_path, &args.powercap_path),
        "cpu",
        &sinks,
    ));
    scheduler.add_collector(build_collector(
        SystemProbe::new(RealFs::new(), &args.proc_path, args.power_cmd.clone()),
        "system",
        &sinks,
    ));

    if args.cluster {
        let mut config = ClusterConfig::from_env();
        config.ttl_seconds = args.heartbeat_ttl;
        if let Some(node_id) = args.node_id.clone() {
            config.node_id = node_id;
        }
        info!(
            "Cluster collector: node={}, ttl={}s",
            config.node_id, config.ttl_seconds
        );
        scheduler.add_collector(build_collector(ClusterProbe::new(config), "cluster", &sinks));
    }

    if scheduler.collector_count() == 0 {
        warn!("No collector could be initialized; nothing to do");
        return;
    }

    info!("Press \"Ctrl+C\" to stop collection");
    scheduler.run();

    // Collector teardown joins their background threads.
    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_match_documented_behavior() {
        let args = Args::parse_from(["hwpulsed"]);
        assert_eq!(args.interval, 10);
        assert!(args.console);
        assert!(!args.database);
        assert!(!args.cluster);
        assert_eq!(args.proc_path, "/proc");
    }

    #[test]
    fn sink_flags_parse() {
        let args = Args::parse_from([
            "hwpulsed",
            "--console=false",
            "--csv-dir",
            "/tmp/metrics",
            "--gauges",
            "--cluster",
            "--node-id",
            "node-3",
        ]);
        assert!(!args.console);
        assert_eq!(args.csv_dir.as_deref(), Some("/tmp/metrics"));
        assert!(args.gauges);
        assert_eq!(args.node_id.as_deref(), Some("node-3"));
    }
}
