//! Delay based congestion control for outstanding chunk requests.
//!
//! The window (in chunks) grows with every chunk that arrives in time. The growth per sample is
//!  `sqrt(max_rtt / rtt * w) / w`: large while the measured round trip time is low compared to
//!  the highest one seen, vanishing as queues build up and the round trip time approaches it.
//!  A batch of timed out requests halves the window.

use std::time::Duration;

use tracing::{instrument, trace};

pub const MIN_WINDOW: f64 = 2.0;

/// Smoothed round trip time estimate (RFC 6298 style)
#[derive(Clone, Copy, Debug, Default)]
pub struct RttEstimator {
    mean: Option<f64>,
    var: f64,
}

impl RttEstimator {
    const MEAN_GAIN: f64 = 0.125;
    const VAR_GAIN: f64 = 0.25;

    pub fn update(&mut self, rtt: Duration) {
        let rtt = rtt.as_secs_f64();
        match self.mean {
            None => {
                self.mean = Some(rtt);
                self.var = rtt / 2.0;
            }
            Some(mean) => {
                self.var += Self::VAR_GAIN * ((mean - rtt).abs() - self.var);
                self.mean = Some(mean + Self::MEAN_GAIN * (rtt - mean));
            }
        }
    }

    pub fn mean(&self) -> Option<Duration> {
        self.mean.map(Duration::from_secs_f64)
    }

    pub fn var(&self) -> Duration {
        Duration::from_secs_f64(self.var)
    }

    /// `mean + max(min_var, 4 * var)` capped at `max_timeout`, or `max_timeout` without samples
    pub fn timeout(&self, min_var: Duration, max_timeout: Duration) -> Duration {
        match self.mean() {
            None => max_timeout,
            Some(mean) => (mean + min_var.max(self.var() * 4)).min(max_timeout),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Etcp {
    window: f64,
    limit: f64,
    max_rtt: Duration,
    rtt: RttEstimator,
    flight_size: u64,
}

impl Etcp {
    pub fn new(limit: u64) -> Etcp {
        Etcp {
            window: MIN_WINDOW,
            limit: (limit as f64).max(MIN_WINDOW),
            max_rtt: Duration::ZERO,
            rtt: RttEstimator::default(),
            flight_size: 0,
        }
    }

    /// congestion window in chunks
    pub fn window(&self) -> u64 {
        self.window as u64
    }

    /// number of requested chunks that have neither arrived nor timed out
    pub fn flight_size(&self) -> u64 {
        self.flight_size
    }

    /// number of chunks that can be requested now
    pub fn available(&self) -> u64 {
        self.window().saturating_sub(self.flight_size)
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn on_sent(&mut self, chunks: u64) {
        self.flight_size += chunks;
    }

    /// A requested chunk arrived after `rtt`
    pub fn on_ack(&mut self, rtt: Duration, chunks: u64) {
        self.flight_size = self.flight_size.saturating_sub(chunks);
        self.rtt.update(rtt);
        self.max_rtt = self.max_rtt.max(rtt);

        let rtt = rtt.max(Duration::from_micros(1)).as_secs_f64();
        let ratio = self.max_rtt.as_secs_f64() / rtt;
        for _ in 0..chunks {
            self.window += (ratio * self.window).sqrt() / self.window;
        }
        self.window = self.window.min(self.limit);
        trace!(window = self.window, rtt, "etcp ack");
    }

    /// A round trip time that was measured outside of chunk transfers, e.g. by a ping
    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        self.rtt.update(rtt);
        self.max_rtt = self.max_rtt.max(rtt);
    }

    /// Requested chunks arrived from somewhere else, they no longer count as in flight
    pub fn on_discard(&mut self, chunks: u64) {
        self.flight_size = self.flight_size.saturating_sub(chunks);
    }

    /// Requests for `chunks` chunks timed out. Called once per batch of timeouts.
    #[instrument(level = "trace", skip(self), fields(window = self.window))]
    pub fn on_loss(&mut self, chunks: u64) {
        self.flight_size = self.flight_size.saturating_sub(chunks);
        self.window = (self.window / 2.0).max(MIN_WINDOW);
        trace!(window = self.window, "halved window");
    }
}
