/// Online mean and variance (Welford's algorithm). Samples are typically durations in
///  nanoseconds, e.g. the lag between the first and a later announcement of a chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Welford {
    count: f64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn new() -> Welford {
        Welford::default()
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1.0;
        let delta = value - self.mean;
        self.mean += delta / self.count;
        self.m2 += delta * (value - self.mean);
    }

    pub fn reset(&mut self) {
        *self = Welford::default();
    }

    pub fn count(&self) -> u64 {
        self.count as u64
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// sample variance, 0 for less than two samples
    pub fn variance(&self) -> f64 {
        if self.count < 2.0 {
            return 0.0;
        }
        self.m2 / (self.count - 1.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Combines the statistics of disjoint sample sets as if all samples had been added to one
    pub fn merge<'a>(items: impl IntoIterator<Item = &'a Welford>) -> Welford {
        let mut result = Welford::default();
        for w in items {
            if w.count == 0.0 {
                continue;
            }
            let count = result.count + w.count;
            let delta = w.mean - result.mean;
            result.mean += delta * w.count / count;
            result.m2 += w.m2 + delta * delta * result.count * w.count / count;
            result.count = count;
        }
        result
    }
}
