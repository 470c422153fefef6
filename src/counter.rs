//! Transfer rate estimation for the progress log.

use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor.
/// Higher values = more responsive to changes, lower values = smoother.
const EMA_ALPHA: f64 = 0.3;

/// Estimates a byte rate from samples of a cumulative counter, smoothing
/// the instantaneous rate with an EMA.
#[derive(Debug)]
pub struct RateEstimator {
    last_total: u64,
    last_update: Instant,
    ema: f64,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self { last_total: 0, last_update: Instant::now(), ema: 0.0 }
    }

    /// Feed the current value of the cumulative counter.
    pub fn update(&mut self, total: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed < 0.001 {
            return;
        }

        let window = total.saturating_sub(self.last_total);
        let rate = window as f64 / elapsed;

        self.ema = if self.ema == 0.0 {
            rate
        } else {
            EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * self.ema
        };

        self.last_total = total;
        self.last_update = now;
    }

    /// The smoothed rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.ema as u64
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[tokio::test]
    async fn smooths_the_rate() {
        let mut estimator = RateEstimator::new();
        assert_eq!(estimator.rate(), 0);

        // 1000 bytes over ~100ms, roughly 10 KB/s
        time::sleep(Duration::from_millis(100)).await;
        estimator.update(1000);
        let first = estimator.rate();
        assert!((8000..=12500).contains(&first));

        // the same window again barely moves the estimate
        time::sleep(Duration::from_millis(100)).await;
        estimator.update(2000);
        let second = estimator.rate();
        assert!((second as i64 - first as i64).abs() < 2000);

        // double the throughput pulls the estimate up
        time::sleep(Duration::from_millis(100)).await;
        estimator.update(4000);
        assert!(estimator.rate() > second);
    }

    #[tokio::test]
    async fn ignores_samples_with_no_elapsed_time() {
        let mut estimator = RateEstimator::new();
        time::sleep(Duration::from_millis(50)).await;
        estimator.update(1000);
        let rate = estimator.rate();

        // immediate resample is dropped instead of dividing by ~zero
        estimator.update(10_000);
        assert_eq!(estimator.rate(), rate);
    }
}
