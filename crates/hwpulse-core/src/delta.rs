//! Delta/rate sampling over monotonically increasing counters.
//!
//! Sources that report rates (bytes/s, watts) keep a [`DeltaState`] holding
//! the previous raw snapshot and its timestamp. Each cycle the baseline is
//! replaced by value, never mutated in place, so a failed cycle can never
//! leave a half-updated baseline behind.
//!
//! [`StuckCounterGuard`] implements the self-heal policy for counter sources
//! that freeze while the hardware is demonstrably busy: after enough
//! consecutive zero-throughput cycles under load, the caller is told to
//! reset the source and re-prime its baseline.

use std::time::Instant;

/// Smallest elapsed interval used for rate division, in seconds.
///
/// Guards against a clock that did not advance between two snapshots.
pub const MIN_ELAPSED_SECS: f64 = 1e-4;

/// Consecutive zero-throughput cycles under load before a counter source is
/// declared stuck.
pub const STUCK_CYCLE_THRESHOLD: u32 = 50;

/// Previous raw counter snapshot plus the instant it was taken.
///
/// Owned exclusively by one probe instance. Created primed: the probe takes
/// one throwaway snapshot at construction so the first real cycle has a
/// valid baseline instead of reporting an infinite or zero rate.
#[derive(Debug)]
pub struct DeltaState<S> {
    before: S,
    before_at: Instant,
}

impl<S> DeltaState<S> {
    pub fn new(baseline: S) -> Self {
        Self {
            before: baseline,
            before_at: Instant::now(),
        }
    }

    pub fn before(&self) -> &S {
        &self.before
    }

    /// Swaps in a new baseline and returns the previous snapshot together
    /// with the clamped elapsed seconds since it was taken.
    pub fn advance(&mut self, after: S) -> (S, f64) {
        self.advance_at(after, Instant::now())
    }

    /// Same as [`advance`](Self::advance) with an explicit instant, so tests
    /// can control elapsed time.
    pub fn advance_at(&mut self, after: S, at: Instant) -> (S, f64) {
        let elapsed = at
            .saturating_duration_since(self.before_at)
            .as_secs_f64()
            .max(MIN_ELAPSED_SECS);
        let previous = std::mem::replace(&mut self.before, after);
        self.before_at = at;
        (previous, elapsed)
    }

    /// Replaces the baseline as if freshly constructed. Used by self-heal.
    pub fn reprime(&mut self, baseline: S) {
        self.before = baseline;
        self.before_at = Instant::now();
    }
}

/// Delta between two counter readings, `None` on regression (counter reset).
pub fn counter_delta(current: u64, previous: u64) -> Option<u64> {
    (current >= previous).then(|| current - previous)
}

/// Rate per second for a counter delta over an elapsed interval.
pub fn rate(delta: f64, elapsed_secs: f64) -> f64 {
    delta / elapsed_secs.max(MIN_ELAPSED_SECS)
}

/// Detects a counter source that froze while the hardware is busy.
///
/// Tracks consecutive cycles where a workload is present but every derived
/// throughput field is zero. Once the streak exceeds the threshold,
/// [`observe`](Self::observe) returns true exactly once and the streak
/// restarts; the caller is expected to reset the source and re-prime its
/// delta baseline. Any non-zero throughput, or an idle cycle, breaks the
/// streak.
#[derive(Debug)]
pub struct StuckCounterGuard {
    zero_cycles: u32,
    threshold: u32,
}

impl Default for StuckCounterGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl StuckCounterGuard {
    pub fn new() -> Self {
        Self::with_threshold(STUCK_CYCLE_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            zero_cycles: 0,
            threshold,
        }
    }

    /// Records one cycle. Returns true when the source should be reset.
    pub fn observe(&mut self, workload_present: bool, throughput_seen: bool) -> bool {
        if throughput_seen || !workload_present {
            self.zero_cycles = 0;
            return false;
        }
        self.zero_cycles += 1;
        if self.zero_cycles > self.threshold {
            self.zero_cycles = 0;
            return true;
        }
        false
    }

    /// Current streak length, for logging and tests.
    pub fn zero_cycles(&self) -> u32 {
        self.zero_cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_rate_scenario() {
        // 100 -> 1100 bytes over two seconds is 500 bytes per second.
        let delta = counter_delta(1100, 100).unwrap();
        assert_eq!(rate(delta as f64, 2.0), 500.0);
    }

    #[test]
    fn counter_regression_yields_none() {
        assert_eq!(counter_delta(50, 100), None);
        assert_eq!(counter_delta(100, 100), Some(0));
    }

    #[test]
    fn rate_clamps_zero_elapsed() {
        let r = rate(10.0, 0.0);
        assert!(r.is_finite());
        assert_eq!(r, 10.0 / MIN_ELAPSED_SECS);
    }

    #[test]
    fn advance_replaces_baseline_and_reports_elapsed() {
        let start = Instant::now();
        let mut state = DeltaState::new(100u64);
        let at = start + Duration::from_secs(2);
        let (previous, elapsed) = state.advance_at(1100, at);
        assert_eq!(previous, 100);
        assert!(elapsed >= MIN_ELAPSED_SECS);
        assert_eq!(*state.before(), 1100);
    }

    #[test]
    fn stuck_guard_fires_on_cycle_after_threshold() {
        let mut guard = StuckCounterGuard::new();
        for _ in 0..STUCK_CYCLE_THRESHOLD {
            assert!(!guard.observe(true, false));
        }
        assert_eq!(guard.zero_cycles(), STUCK_CYCLE_THRESHOLD);
        // The next busy-but-silent cycle triggers the reset.
        assert!(guard.observe(true, false));
        assert_eq!(guard.zero_cycles(), 0);
    }

    #[test]
    fn stuck_guard_resets_on_throughput() {
        let mut guard = StuckCounterGuard::new();
        for _ in 0..40 {
            guard.observe(true, false);
        }
        assert!(!guard.observe(true, true));
        assert_eq!(guard.zero_cycles(), 0);
    }

    #[test]
    fn stuck_guard_ignores_idle_cycles() {
        let mut guard = StuckCounterGuard::new();
        for _ in 0..40 {
            guard.observe(true, false);
        }
        // No workload: zero throughput is expected, streak breaks.
        assert!(!guard.observe(false, false));
        assert_eq!(guard.zero_cycles(), 0);
    }
}
