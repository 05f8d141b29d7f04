//! Fixed-interval collection scheduler.
//!
//! One thread runs the tick loop; collectors execute sequentially within a
//! tick and never concurrently with each other. Each collector runs inside
//! its own failure boundary: a recoverable error skips that collector for
//! the cycle, a fatal error stops the whole loop before any further
//! collector runs.
//!
//! The stop flag is supplied at construction so a signal handler only ever
//! flips an atomic; it is observed at tick boundaries, not mid-collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, error, info};

use crate::collector::Collector;
use crate::error::CollectError;

/// Slice used for shutdown-aware sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

pub struct Scheduler {
    interval: Duration,
    running: Arc<AtomicBool>,
    collectors: Vec<Box<dyn Collector>>,
    state: SchedulerState,
}

impl Scheduler {
    /// The `running` flag is shared with whoever requests shutdown (the
    /// ctrl-c handler in the daemon); it must start out true.
    pub fn new(interval: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            interval,
            running,
            collectors: Vec::new(),
            state: SchedulerState::Idle,
        }
    }

    /// Registers a collector from its construction result.
    ///
    /// A collector that failed to construct is logged and omitted while the
    /// daemon continues with the rest; one broken source must not take down
    /// unrelated sources. Registration happens before `run()` only.
    pub fn add_collector(&mut self, collector: Result<Box<dyn Collector>, CollectError>) {
        match collector {
            Ok(collector) => {
                info!(collector = %collector.name(), "collector registered");
                self.collectors.push(collector);
            }
            Err(CollectError::Fatal(msg)) => {
                error!("collector disabled, failed to initialize: {}", msg);
            }
            Err(CollectError::Recoverable(msg)) => {
                error!("collector disabled: {}", msg);
            }
        }
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Requests a cooperative stop; safe from any thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs the tick loop until stopped.
    ///
    /// Drift-correcting: the next tick is computed from the previous one,
    /// so a slow cycle shortens or skips the following sleep instead of
    /// accumulating delay across cycles.
    pub fn run(&mut self) {
        self.state = SchedulerState::Running;
        info!(
            collectors = self.collectors.len(),
            interval_secs = self.interval.as_secs_f64(),
            "collection loop started"
        );

        let mut next_tick = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            self.collect_all(Local::now());

            next_tick += self.interval;
            while self.running.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= next_tick {
                    break;
                }
                std::thread::sleep((next_tick - now).min(SLEEP_SLICE));
            }
        }

        self.state = SchedulerState::Stopped;
        info!("collection loop stopped");
    }

    /// One tick: every collector in registration order, each inside its own
    /// failure boundary.
    fn collect_all(&mut self, now: DateTime<Local>) {
        let running = Arc::clone(&self.running);
        for collector in &mut self.collectors {
            let name = collector.name();
            match collector.collect(now) {
                Ok(()) => {
                    debug!(collector = %name, "metrics retrieved");
                }
                Err(CollectError::Recoverable(msg)) => {
                    // This collector contributes nothing this cycle.
                    error!(collector = %name, "recoverable error: {}", msg);
                }
                Err(CollectError::Fatal(msg)) => {
                    error!(collector = %name, "fatal error, stopping collection: {}", msg);
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}
