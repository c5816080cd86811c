//! Per-task progress measurement.
//!
//! Turns raw byte-count callbacks into a percentage, a debounced throughput
//! estimate and an ETA. The meter is a plain value: callers pass the
//! observation time in, which keeps it deterministic under test.
//!
//! Only the scheduler stores the results; the meter itself never touches
//! task state.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Default minimum interval between throughput samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// ETAs beyond this are considered meaningless and not reported.
const MAX_ETA: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of one byte-count observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub loaded: u64,
    pub total: u64,
    pub percentage: u8,
    pub bytes_per_sec: Option<f64>,
    pub eta_secs: Option<u64>,
    /// Whether this observation produced a fresh throughput sample.
    pub sampled: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressMeter {
    min_interval: Duration,
    last_sample: Option<(Instant, u64)>,
    speed: Option<f64>,
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl ProgressMeter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sample: None,
            speed: None,
        }
    }

    /// Record that `loaded` of `total` bytes have been handed to the network.
    ///
    /// Throughput is only recomputed once `min_interval` has passed since the
    /// previous sample; in between, the previous estimate is kept. A byte
    /// count lower than the last sample (a retried request starting over)
    /// restarts the baseline and drops the estimate.
    pub fn observe(&mut self, loaded: u64, total: u64, now: Instant) -> ProgressSnapshot {
        let loaded = loaded.min(total);
        let mut sampled = false;

        match self.last_sample {
            None => self.last_sample = Some((now, loaded)),
            Some((_, prev_loaded)) if loaded < prev_loaded => {
                self.last_sample = Some((now, loaded));
                self.speed = None;
            }
            Some((prev_at, prev_loaded)) => {
                let elapsed = now.saturating_duration_since(prev_at);
                if elapsed >= self.min_interval && !elapsed.is_zero() {
                    self.speed = Some((loaded - prev_loaded) as f64 / elapsed.as_secs_f64());
                    self.last_sample = Some((now, loaded));
                    sampled = true;
                }
            }
        }

        ProgressSnapshot {
            loaded,
            total,
            percentage: percentage(loaded, total),
            bytes_per_sec: self.speed,
            eta_secs: eta(total - loaded, self.speed),
            sampled,
        }
    }

    /// Forget the baseline and estimate, e.g. before a new phase.
    pub fn reset(&mut self) {
        self.last_sample = None;
        self.speed = None;
    }
}

/// `round(100 * loaded / total)`, clamped to 0..=100. An empty total counts
/// as no progress.
pub fn percentage(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (loaded as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

fn eta(remaining: u64, speed: Option<f64>) -> Option<u64> {
    let speed = speed.filter(|s| *s > 0.0)?;
    let secs = remaining as f64 / speed;
    if !secs.is_finite() || secs > MAX_ETA.as_secs_f64() {
        return None;
    }
    Some(secs.ceil() as u64)
}

/// Scale a 0..=100 percentage into the `[lo, hi]` window of a task's overall
/// progress.
pub fn scale_into(pct: u8, lo: u8, hi: u8) -> u8 {
    let span = hi.saturating_sub(lo) as f64;
    let scaled = lo as f64 + span * pct.min(100) as f64 / 100.0;
    (scaled.round() as u8).clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn percentage_rounds_and_clamps() {
        assert_eq!(percentage(0, 100), 0);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(100, 100), 100);
        assert_eq!(percentage(5, 0), 0);
    }

    #[test]
    fn first_observation_has_no_speed() {
        let mut meter = ProgressMeter::default();
        let snap = meter.observe(10 * MB, 100 * MB, Instant::now());

        assert_eq!(snap.percentage, 10);
        assert_eq!(snap.bytes_per_sec, None);
        assert_eq!(snap.eta_secs, None);
        assert!(!snap.sampled);
    }

    #[test]
    fn speed_and_eta_after_one_window() {
        let start = Instant::now();
        let mut meter = ProgressMeter::default();
        meter.observe(0, 100 * MB, start);

        let snap = meter.observe(10 * MB, 100 * MB, start + Duration::from_secs(1));
        assert!(snap.sampled);
        assert_eq!(snap.bytes_per_sec, Some((10 * MB) as f64));
        assert_eq!(snap.eta_secs, Some(9));
    }

    #[test]
    fn updates_inside_the_window_keep_previous_speed() {
        let start = Instant::now();
        let mut meter = ProgressMeter::new(Duration::from_millis(100));
        meter.observe(0, 100 * MB, start);
        let first = meter.observe(MB, 100 * MB, start + Duration::from_millis(200));

        let storm = meter.observe(50 * MB, 100 * MB, start + Duration::from_millis(210));
        assert!(!storm.sampled);
        assert_eq!(storm.bytes_per_sec, first.bytes_per_sec);
        assert_eq!(storm.percentage, 50);
    }

    #[test]
    fn unrealistic_eta_is_not_reported() {
        let start = Instant::now();
        let mut meter = ProgressMeter::default();
        meter.observe(0, 400 * MB, start);

        // One byte per second would take far longer than a day.
        let snap = meter.observe(1, 400 * MB, start + Duration::from_secs(1));
        assert_eq!(snap.bytes_per_sec, Some(1.0));
        assert_eq!(snap.eta_secs, None);
    }

    #[test]
    fn stalled_transfer_has_no_eta() {
        let start = Instant::now();
        let mut meter = ProgressMeter::default();
        meter.observe(MB, 10 * MB, start);
        let snap = meter.observe(MB, 10 * MB, start + Duration::from_secs(2));

        assert_eq!(snap.bytes_per_sec, Some(0.0));
        assert_eq!(snap.eta_secs, None);
    }

    #[test]
    fn restarted_count_resets_estimate() {
        let start = Instant::now();
        let mut meter = ProgressMeter::default();
        meter.observe(0, 10 * MB, start);
        meter.observe(5 * MB, 10 * MB, start + Duration::from_secs(1));

        let snap = meter.observe(MB, 10 * MB, start + Duration::from_secs(2));
        assert_eq!(snap.bytes_per_sec, None);
        assert_eq!(snap.percentage, 10);
    }

    #[test]
    fn scaling_into_phase_windows() {
        assert_eq!(scale_into(0, 0, 90), 0);
        assert_eq!(scale_into(50, 0, 90), 45);
        assert_eq!(scale_into(100, 0, 90), 90);
        assert_eq!(scale_into(100, 0, 100), 100);
    }
}
