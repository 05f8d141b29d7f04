//! Cluster membership probe over a Redis link.
//!
//! Each daemon advertises itself with an expiring heartbeat key; the probe
//! reports link health, PING latency and how many nodes are currently
//! alive (counted with a cursor SCAN over the heartbeat pattern).
//!
//! The link is shared between the sampling path and a background heartbeat
//! thread. One non-re-entrant mutex guards the connection; every helper
//! that touches it takes the already-locked [`LinkState`], so nested calls
//! cannot re-lock. On any I/O failure the connection is dropped and the
//! next `ensure_connection` repairs it. Neither error kind ever escapes
//! the heartbeat thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::collector::Probe;
use crate::error::CollectError;
use crate::sample::{LabelSet, LabelValue, MetricSet};

/// Bound on one connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Read/write timeout on the established connection. Keep this well below
/// the collection interval so a hung peer cannot stall the scheduler.
const IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Slice used for shutdown-aware sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

const HEARTBEAT_PATTERN: &str = "cluster:node:*:heartbeat";

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Redis URL, `redis://[:password@]host:port/`.
    pub url: String,
    /// Unique identifier this node advertises.
    pub node_id: String,
    /// Heartbeat key expiry; the send interval is half of it.
    pub ttl_seconds: u64,
    /// Whether to run the background heartbeat sender.
    pub heartbeat: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            node_id: "localhost".to_string(),
            ttl_seconds: 5,
            heartbeat: true,
        }
    }
}

impl ClusterConfig {
    /// Reads `REDIS_URL` and `HOSTNAME`, falling back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }
        if let Ok(node_id) = std::env::var("HOSTNAME") {
            config.node_id = node_id;
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct ClusterLabel {
    pub cluster: String,
}

impl LabelSet for ClusterLabel {
    const COLUMNS: &'static [&'static str] = &["cluster"];
    const KEY: &'static [&'static str] = &["cluster"];

    fn values(&self) -> Vec<LabelValue> {
        vec![LabelValue::Text(self.cluster.clone())]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterMetrics {
    pub connected: Option<f64>,
    pub latency_ms: Option<f64>,
    pub active_nodes: Option<f64>,
}

impl MetricSet for ClusterMetrics {
    const FIELDS: &'static [&'static str] = &["connected", "latency_ms", "active_nodes"];

    fn values(&self) -> Vec<Option<f64>> {
        vec![self.connected, self.latency_ms, self.active_nodes]
    }
}

/// Connection slot behind the link mutex.
struct LinkState {
    conn: Option<redis::Connection>,
}

/// Shared Redis link: sampling path and heartbeat thread both go through
/// the mutex; all connection helpers require the locked state.
struct ClusterLink {
    client: redis::Client,
    node_id: String,
    ttl_seconds: u64,
    state: Mutex<LinkState>,
    stop: AtomicBool,
}

impl ClusterLink {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // A panic while holding the lock leaves the state usable: the
            // connection is either live or will be re-established.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns true when a connection is available, attempting one bounded
    /// connect otherwise. Idempotent and never raises.
    fn ensure_connection(&self, state: &mut LinkState) -> bool {
        if state.conn.is_some() {
            return true;
        }
        match self.client.get_connection_with_timeout(CONNECT_TIMEOUT) {
            Ok(conn) => {
                if let Err(e) = conn
                    .set_read_timeout(Some(IO_TIMEOUT))
                    .and_then(|_| conn.set_write_timeout(Some(IO_TIMEOUT)))
                {
                    warn!(error = %e, "cluster link timeout setup failed");
                    return false;
                }
                debug!(node = %self.node_id, "cluster link connected");
                state.conn = Some(conn);
                true
            }
            Err(e) => {
                warn!(error = %e, "cluster link connect failed");
                false
            }
        }
    }

    /// Sends one heartbeat. Failures are logged and mark the connection
    /// down for the next `ensure_connection` to repair; nothing is raised
    /// because this runs on the background thread.
    fn send_heartbeat(&self, state: &mut LinkState) {
        if !self.ensure_connection(state) {
            return;
        }
        let key = heartbeat_key(&self.node_id);
        let Some(conn) = state.conn.as_mut() else {
            return;
        };
        match redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("EX")
            .arg(self.ttl_seconds)
            .query::<()>(conn)
        {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "heartbeat failed, connection marked down");
                state.conn = None;
            }
        }
    }

    fn ping_latency_ms(&self, state: &mut LinkState) -> Option<f64> {
        let conn = state.conn.as_mut()?;
        let start = Instant::now();
        match redis::cmd("PING").query::<String>(conn) {
            Ok(_) => Some(start.elapsed().as_secs_f64() * 1000.0),
            Err(e) => {
                warn!(error = %e, "ping failed, connection marked down");
                state.conn = None;
                None
            }
        }
    }

    /// Counts live heartbeat keys with a full cursor scan. A mid-scan
    /// failure aborts the whole count rather than reporting a partial one.
    fn count_active_nodes(&self, state: &mut LinkState) -> Result<u64, CollectError> {
        if !self.ensure_connection(state) {
            return Err(CollectError::recoverable(
                "cluster link unavailable while counting nodes",
            ));
        }
        let Some(conn) = state.conn.as_mut() else {
            return Err(CollectError::recoverable("cluster link lost"));
        };

        let result = count_pages(|cursor| {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(HEARTBEAT_PATTERN)
                .arg("COUNT")
                .arg(100)
                .query::<(String, Vec<String>)>(conn)
                .map(|(next, keys)| (next, keys.len() as u64))
        });

        result.map_err(|e| {
            state.conn = None;
            CollectError::recoverable(format!("node scan aborted: {}", e))
        })
    }
}

/// Drives a cursor-paginated scan to completion, accumulating counts.
/// The scan is complete when the cursor returns to its start value.
fn count_pages<E>(mut fetch: impl FnMut(&str) -> Result<(String, u64), E>) -> Result<u64, E> {
    let mut cursor = "0".to_string();
    let mut total = 0;
    loop {
        let (next, count) = fetch(&cursor)?;
        total += count;
        cursor = next;
        if cursor == "0" {
            return Ok(total);
        }
    }
}

fn heartbeat_key(node_id: &str) -> String {
    format!("cluster:node:{}:heartbeat", node_id)
}

/// Send interval is half the key expiry, floored at 100 ms.
fn heartbeat_interval(ttl_seconds: u64) -> Duration {
    Duration::from_millis((ttl_seconds * 1000 / 2).max(100))
}

pub struct ClusterProbe {
    link: Arc<ClusterLink>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ClusterProbe {
    /// Builds the link and, when configured, starts the heartbeat thread.
    ///
    /// An unreachable service is not an error here: the link repairs
    /// itself on use. Only an unparsable URL invalidates the collector.
    pub fn new(config: ClusterConfig) -> Result<Self, CollectError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CollectError::fatal(format!("invalid redis url: {}", e)))?;

        let link = Arc::new(ClusterLink {
            client,
            node_id: config.node_id,
            ttl_seconds: config.ttl_seconds,
            state: Mutex::new(LinkState { conn: None }),
            stop: AtomicBool::new(false),
        });

        {
            let mut state = link.lock_state();
            if link.ensure_connection(&mut state) {
                info!(node = %link.node_id, "cluster link established at startup");
            } else {
                warn!(node = %link.node_id, "cluster service unreachable at startup, will retry each cycle");
            }
        }

        let heartbeat = config.heartbeat.then(|| {
            let thread_link = Arc::clone(&link);
            std::thread::spawn(move || {
                let interval = heartbeat_interval(thread_link.ttl_seconds);
                info!(
                    node = %thread_link.node_id,
                    interval_ms = interval.as_millis() as u64,
                    "heartbeat thread started"
                );
                while !thread_link.stop.load(Ordering::Relaxed) {
                    {
                        // Lock only around the send.
                        let mut state = thread_link.lock_state();
                        thread_link.send_heartbeat(&mut state);
                    }
                    let mut remaining = interval;
                    while remaining > Duration::ZERO && !thread_link.stop.load(Ordering::Relaxed)
                    {
                        let slice = remaining.min(SLEEP_SLICE);
                        std::thread::sleep(slice);
                        remaining = remaining.saturating_sub(slice);
                    }
                }
                info!("heartbeat thread stopped");
            })
        });

        Ok(Self { link, heartbeat })
    }
}

impl Drop for ClusterProbe {
    fn drop(&mut self) {
        // The thread must be gone before the link can be freed.
        self.link.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
    }
}

impl Probe for ClusterProbe {
    type Label = ClusterLabel;
    type Metric = ClusterMetrics;

    fn name(&self) -> String {
        "cluster".to_string()
    }

    fn labels(&mut self) -> Result<Vec<ClusterLabel>, CollectError> {
        Ok(vec![ClusterLabel {
            cluster: "global".to_string(),
        }])
    }

    fn sample(&mut self, labels: &[ClusterLabel]) -> Result<Vec<ClusterMetrics>, CollectError> {
        let link = &self.link;
        let mut state = link.lock_state();

        if !link.ensure_connection(&mut state) {
            // Skip this cycle; the long-term state stays valid.
            return Err(CollectError::recoverable("cluster link unavailable"));
        }

        let mut metrics = ClusterMetrics {
            connected: Some(1.0),
            ..ClusterMetrics::default()
        };
        metrics.latency_ms = link.ping_latency_ms(&mut state);
        metrics.active_nodes = match link.count_active_nodes(&mut state) {
            Ok(count) => Some(count as f64),
            Err(e) => {
                warn!(error = %e, "node counting skipped this cycle");
                None
            }
        };

        Ok(labels.iter().map(|_| metrics.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginated_scan_accumulates_across_pages() {
        let pages = vec![("17".to_string(), 40u64), ("0".to_string(), 12u64)];
        let mut calls = 0;
        let total = count_pages(|cursor| -> Result<(String, u64), String> {
            let expected = if calls == 0 { "0" } else { "17" };
            assert_eq!(cursor, expected);
            let page = pages[calls].clone();
            calls += 1;
            Ok(page)
        })
        .unwrap();
        assert_eq!(total, 52);
        assert_eq!(calls, 2);
    }

    #[test]
    fn single_page_scan_terminates() {
        let total =
            count_pages(|_| -> Result<(String, u64), String> { Ok(("0".to_string(), 3)) })
                .unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn mid_scan_error_aborts_whole_count() {
        let mut calls = 0;
        let result = count_pages(|_| -> Result<(String, u64), String> {
            calls += 1;
            if calls == 1 {
                Ok(("42".to_string(), 40))
            } else {
                Err("io error".to_string())
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn heartbeat_interval_is_half_ttl_with_floor() {
        assert_eq!(heartbeat_interval(5), Duration::from_millis(2500));
        assert_eq!(heartbeat_interval(1), Duration::from_millis(500));
        assert_eq!(heartbeat_interval(0), Duration::from_millis(100));
    }

    #[test]
    fn heartbeat_key_embeds_node_id() {
        assert_eq!(heartbeat_key("node-7"), "cluster:node:node-7:heartbeat");
    }

    #[test]
    fn invalid_url_is_fatal() {
        let config = ClusterConfig {
            url: "not a url".to_string(),
            heartbeat: false,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            ClusterProbe::new(config),
            Err(CollectError::Fatal(_))
        ));
    }

    #[test]
    fn unreachable_service_defers_instead_of_failing() {
        // Nothing listens on port 1; construction must still succeed and
        // sampling must surface a recoverable error.
        let config = ClusterConfig {
            url: "redis://127.0.0.1:1/".to_string(),
            heartbeat: false,
            ..ClusterConfig::default()
        };
        let mut probe = ClusterProbe::new(config).unwrap();
        let labels = probe.labels().unwrap();
        assert!(matches!(
            probe.sample(&labels),
            Err(CollectError::Recoverable(_))
        ));
    }

    #[test]
    fn heartbeat_thread_joins_promptly_on_drop() {
        let config = ClusterConfig {
            url: "redis://127.0.0.1:1/".to_string(),
            ttl_seconds: 1,
            heartbeat: true,
            ..ClusterConfig::default()
        };
        let probe = ClusterProbe::new(config).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(probe); // joins the sender; must not hang
    }
}
