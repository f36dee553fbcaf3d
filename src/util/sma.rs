use std::time::{Duration, Instant};

/// Simple moving average over a sliding window of `window_len` time buckets of `interval`
///  each. Buckets that fall out of the window are cleared lazily when time advances.
///
/// It tracks both a sum of values and a number of samples, so it can answer "bytes per second"
///  (via [Sma::rate]) as well as "chunks per second" (via [Sma::sample_rate]) or the mean of the
///  samples in the window.
#[derive(Clone, Debug)]
pub struct Sma {
    interval: Duration,
    buckets: Vec<Bucket>,
    epoch: Instant,
    /// number of the most recent bucket, counted in intervals since `epoch`
    last: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    sum: u64,
    count: u64,
}

impl Sma {
    pub fn new(window_len: usize, interval: Duration) -> Sma {
        Self::with_epoch(window_len, interval, Instant::now())
    }

    pub fn with_epoch(window_len: usize, interval: Duration, epoch: Instant) -> Sma {
        assert!(window_len > 0, "window must not be empty");
        assert!(!interval.is_zero(), "interval must not be zero");
        Sma {
            interval,
            buckets: vec![Bucket::default(); window_len],
            epoch,
            last: 0,
        }
    }

    fn bucket_number(&self, t: Instant) -> u64 {
        (t.saturating_duration_since(self.epoch).as_nanos() / self.interval.as_nanos()) as u64
    }

    fn advance(&mut self, t: Instant) {
        let n = self.bucket_number(t);
        if n <= self.last {
            return;
        }

        let len = self.buckets.len() as u64;
        let stale = (n - self.last).min(len);
        for i in 1..=stale {
            let idx = ((self.last + i) % len) as usize;
            self.buckets[idx] = Bucket::default();
        }
        self.last = n;
    }

    fn current(&mut self) -> &mut Bucket {
        let idx = (self.last % self.buckets.len() as u64) as usize;
        &mut self.buckets[idx]
    }

    /// number of intervals covered by the window so far
    fn span(&self) -> u64 {
        (self.last + 1).min(self.buckets.len() as u64)
    }

    pub fn add(&mut self, value: u64) {
        self.add_with_time(value, Instant::now());
    }

    pub fn add_with_time(&mut self, value: u64, t: Instant) {
        self.add_n_with_time(1, value, t);
    }

    /// adds `n` samples of `value` each
    pub fn add_n_with_time(&mut self, n: u64, value: u64, t: Instant) {
        self.advance(t);
        let bucket = self.current();
        bucket.count += n;
        bucket.sum += n * value;
    }

    /// sum of values in the window, scaled to `per`
    pub fn rate(&mut self, per: Duration, t: Instant) -> u64 {
        self.advance(t);
        let sum: u64 = self.buckets.iter().map(|b| b.sum).sum();
        self.scale(sum, per)
    }

    /// number of samples in the window, scaled to `per`
    pub fn sample_rate(&mut self, per: Duration, t: Instant) -> u64 {
        self.advance(t);
        let count: u64 = self.buckets.iter().map(|b| b.count).sum();
        self.scale(count, per)
    }

    pub fn mean(&mut self, t: Instant) -> f64 {
        self.advance(t);
        let (sum, count) = self.buckets.iter()
            .fold((0u64, 0u64), |(s, c), b| (s + b.sum, c + b.count));
        if count == 0 {
            return 0.0;
        }
        sum as f64 / count as f64
    }

    fn scale(&self, value: u64, per: Duration) -> u64 {
        let window = self.interval.as_nanos() * self.span() as u128;
        (value as u128 * per.as_nanos() / window) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_rate_over_partial_window() {
        let epoch = Instant::now();
        let mut sma = Sma::with_epoch(4, SECOND, epoch);
        sma.add_with_time(100, epoch);
        sma.add_with_time(100, epoch + SECOND);

        assert_eq!(sma.rate(SECOND, epoch + SECOND), 100);
        assert_eq!(sma.sample_rate(SECOND, epoch + SECOND), 1);
    }

    #[test]
    fn test_old_buckets_expire() {
        let epoch = Instant::now();
        let mut sma = Sma::with_epoch(2, SECOND, epoch);
        sma.add_with_time(100, epoch);
        sma.add_with_time(50, epoch + SECOND);
        assert_eq!(sma.rate(SECOND, epoch + SECOND), 75);

        assert_eq!(sma.rate(SECOND, epoch + 2 * SECOND), 25);
        assert_eq!(sma.rate(SECOND, epoch + 10 * SECOND), 0);
    }

    #[test]
    fn test_samples_and_mean() {
        let epoch = Instant::now();
        let mut sma = Sma::with_epoch(10, Duration::from_millis(100), epoch);
        sma.add_n_with_time(4, 20, epoch);
        sma.add_n_with_time(1, 70, epoch + Duration::from_millis(50));

        assert_eq!(sma.mean(epoch + Duration::from_millis(50)), 30.0);
        assert_eq!(sma.sample_rate(SECOND, epoch + Duration::from_millis(50)), 50);
    }
}
