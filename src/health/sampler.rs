//! Fixed-window moving average for noisy utilization metrics.

/// Circular buffer producing a trailing average once every slot has been written.
///
/// The sampler is `Filling` until the cursor has wrapped once and `Ready` from then on;
/// it never reports an average built from unwritten slots.
#[derive(Debug, Clone)]
pub struct MovingAverageSampler {
    buffer: Vec<f64>,
    cursor: usize,
    filled: bool,
}

impl MovingAverageSampler {
    /// Create a sampler over `window_size` samples (at least one).
    pub fn new(window_size: usize) -> Self {
        Self {
            buffer: vec![0.0; window_size.max(1)],
            cursor: 0,
            filled: false,
        }
    }

    /// Number of samples averaged.
    pub fn window_size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the window has been filled once.
    pub fn is_ready(&self) -> bool {
        self.filled
    }

    /// Record a sample and return the window average if the sampler is ready.
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        self.buffer[self.cursor] = sample;
        self.cursor = (self.cursor + 1) % self.buffer.len();
        if self.cursor == 0 {
            self.filled = true;
        }
        self.average()
    }

    /// Current window average, `None` while filling.
    pub fn average(&self) -> Option<f64> {
        self.filled
            .then(|| self.buffer.iter().sum::<f64>() / self.buffer.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_value_until_window_is_full() {
        let mut sampler = MovingAverageSampler::new(4);
        assert_eq!(sampler.push(0.1), None);
        assert_eq!(sampler.push(0.2), None);
        assert_eq!(sampler.push(0.3), None);
        assert!(!sampler.is_ready());
        let avg = sampler.push(0.4).unwrap();
        assert!((avg - 0.25).abs() < 1e-12);
        assert!(sampler.is_ready());
    }

    #[test]
    fn trailing_average_drops_oldest_sample() {
        let mut sampler = MovingAverageSampler::new(3);
        sampler.push(1.0);
        sampler.push(1.0);
        sampler.push(1.0);
        let avg = sampler.push(0.0).unwrap();
        assert!((avg - 2.0 / 3.0).abs() < 1e-12);
        // stays ready after further wraps
        for _ in 0..10 {
            assert!(sampler.push(0.5).is_some());
        }
    }

    #[test]
    fn window_of_one_is_ready_immediately() {
        let mut sampler = MovingAverageSampler::new(1);
        assert_eq!(sampler.push(0.7), Some(0.7));
    }

    #[test]
    fn zero_window_is_treated_as_one() {
        let sampler = MovingAverageSampler::new(0);
        assert_eq!(sampler.window_size(), 1);
    }
}
