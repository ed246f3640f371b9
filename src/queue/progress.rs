use std::collections::VecDeque;
use std::time::{Duration, Instant};
use crate::core::Progress;

/// Smallest window that can still produce a speed.
const MIN_SAMPLES: usize = 2;

/// Sliding-window throughput and ETA estimator for one transfer.
///
/// Speed is the byte delta between the oldest and newest sample divided by the
/// time between them. It is a smoothing heuristic, not a measurement.
#[derive(Debug)]
pub struct ProgressEstimator {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
    total: u64,
    started_at: Instant,
}

impl ProgressEstimator {
    pub fn new(total: u64, max_samples: usize) -> Self {
        let max_samples = max_samples.max(MIN_SAMPLES);

        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
            total,
            started_at: Instant::now(),
        }
    }

    pub fn record(&mut self, loaded: u64) {
        self.record_at(Instant::now(), loaded);
    }

    pub fn record_at(&mut self, timestamp: Instant, loaded: u64) {
        // a transport may restart its count; the old samples are meaningless then
        if let Some(&(_, last)) = self.samples.back() {
            if loaded < last {
                self.samples.clear();
            }
        }

        self.samples.push_back((timestamp, loaded));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn loaded(&self) -> u64 {
        self.samples.back().map(|&(_, loaded)| loaded).unwrap_or(0)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Bytes per second across the window, zero with fewer than two samples.
    pub fn speed(&self) -> f64 {
        if self.samples.len() < MIN_SAMPLES {
            return 0.0;
        }

        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        if last_at <= first_at || last < first {
            return 0.0;
        }

        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed > 0.0 {
            (last - first) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }

        let remaining = self.total.saturating_sub(self.loaded());
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// Whole-attempt average, used for history records.
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.loaded() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> Progress {
        let loaded = self.loaded();
        let percentage = if self.total > 0 {
            ((loaded as f64 / self.total as f64) * 100.0).min(100.0)
        } else {
            0.0
        };

        Progress {
            loaded,
            total: self.total,
            percentage,
            speed: self.speed(),
            eta: self.eta(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fewer_than_two_samples() {
        let mut estimator = ProgressEstimator::new(1000, 10);
        let progress = estimator.snapshot();
        assert_eq!(progress.speed, 0.0);
        assert_eq!(progress.eta, None);

        estimator.record(100);
        let progress = estimator.snapshot();
        assert_eq!(progress.loaded, 100);
        assert_eq!(progress.percentage, 10.0);
        assert_eq!(progress.speed, 0.0);
        assert_eq!(progress.eta, None);
    }

    #[test]
    fn test_eta_decreases_under_constant_speed() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new(10_000, 10);
        let mut last_eta: Option<Duration> = None;

        for step in 0..=10u64 {
            estimator.record_at(start + Duration::from_millis(step * 100), step * 1000);
            let progress = estimator.snapshot();

            assert!(progress.speed >= 0.0);
            if step == 0 {
                assert_eq!(progress.eta, None);
                continue;
            }

            // 1000 bytes per 100ms
            assert!((progress.speed - 10_000.0).abs() < 1.0);
            let eta = progress.eta.unwrap();
            if let Some(last) = last_eta {
                assert!(eta < last || eta.is_zero());
            }
            last_eta = Some(eta);
        }

        assert_eq!(last_eta, Some(Duration::ZERO));
        assert_eq!(estimator.snapshot().percentage, 100.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new(u64::MAX, 5);

        for step in 0..50u64 {
            estimator.record_at(start + Duration::from_millis(step), step);
        }

        assert_eq!(estimator.sample_count(), 5);
    }

    #[test]
    fn test_restarted_count_resets_window() {
        let start = Instant::now();
        let mut estimator = ProgressEstimator::new(1000, 10);

        estimator.record_at(start, 500);
        estimator.record_at(start + Duration::from_millis(100), 600);
        estimator.record_at(start + Duration::from_millis(200), 10);

        assert_eq!(estimator.sample_count(), 1);
        assert_eq!(estimator.speed(), 0.0);
    }
}
