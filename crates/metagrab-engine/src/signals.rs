use std::collections::VecDeque;

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(current) => self.alpha * sample + (1.0 - self.alpha) * current,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Z-score spike detector over a bounded rolling window.
///
/// Needs a minimum number of samples before it will flag anything, so cold
/// starts never read as anomalies.
#[derive(Debug, Clone)]
pub struct ZScoreDetector {
    window: VecDeque<f64>,
    window_size: usize,
    threshold: f64,
    min_samples: usize,
}

impl ZScoreDetector {
    pub fn new(window_size: usize, threshold: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            threshold,
            min_samples: 10,
        }
    }

    /// Push a sample; returns `(z_score, is_spike)`.
    pub fn update(&mut self, sample: f64) -> (f64, bool) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        if self.window.len() < self.min_samples {
            return (0.0, false);
        }

        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        let stdev = variance.sqrt();
        if stdev == 0.0 {
            return (0.0, false);
        }

        let z = (sample - mean).abs() / stdev;
        (z, z > self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_starts_at_first_sample_and_tracks() {
        let mut ewma = Ewma::new(0.3);
        assert_eq!(ewma.update(10.0), 10.0);
        let second = ewma.update(20.0);
        assert!(second > 10.0 && second < 20.0);
    }

    #[test]
    fn zscore_is_quiet_below_min_samples() {
        let mut detector = ZScoreDetector::new(50, 2.0);
        for _ in 0..9 {
            let (_, spike) = detector.update(1.0);
            assert!(!spike);
        }
        // even an extreme value is not flagged without enough history
        let (_, spike) = detector.update(100.0);
        assert!(!spike);
    }

    #[test]
    fn zscore_flags_an_outlier() {
        let mut detector = ZScoreDetector::new(50, 2.0);
        for i in 0..30 {
            detector.update(1.0 + (i % 3) as f64 * 0.1);
        }
        let (z, spike) = detector.update(10.0);
        assert!(spike, "z = {z}");
    }

    #[test]
    fn zscore_window_is_bounded() {
        let mut detector = ZScoreDetector::new(5, 2.0);
        for i in 0..100 {
            detector.update(i as f64);
        }
        assert_eq!(detector.window.len(), 5);
    }
}
