//! Per-frame timing statistics registered by the driver.

use tracing::info;

/// Summary of one timing series, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl TimingStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            count: samples.len(),
            mean,
            median,
            std: var.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        })
    }
}

/// Resize and track times (ms) inserted by the driver.
#[derive(Debug, Default)]
pub struct TimingRegister {
    resize: Vec<f64>,
    track: Vec<f64>,
}

impl TimingRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_resize(&mut self, ms: f64) {
        self.resize.push(ms);
    }

    pub fn insert_track(&mut self, ms: f64) {
        self.track.push(ms);
    }

    pub fn resize_stats(&self) -> Option<TimingStats> {
        TimingStats::from_samples(&self.resize)
    }

    pub fn track_stats(&self) -> Option<TimingStats> {
        TimingStats::from_samples(&self.track)
    }

    /// Log every non-empty series.
    pub fn log_report(&self) {
        for (name, stats) in [("Resize", self.resize_stats()), ("Track", self.track_stats())] {
            let Some(s) = stats else {
                continue;
            };
            info!(
                "{} time (ms): mean {:.3}, median {:.3}, std {:.3}, min {:.3}, max {:.3} ({} samples)",
                name, s.mean, s.median, s.std, s.min, s.max, s.count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let s = TimingStats::from_samples(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(s.count, 4);
        assert!((s.mean - 2.5).abs() < 1e-12);
        assert!((s.median - 2.5).abs() < 1e-12);
        assert!((s.std - 1.25f64.sqrt()).abs() < 1e-12);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
    }

    #[test]
    fn test_odd_median() {
        let s = TimingStats::from_samples(&[9.0, 1.0, 5.0]).unwrap();
        assert_eq!(s.median, 5.0);
    }

    #[test]
    fn test_register_series_are_independent() {
        let mut reg = TimingRegister::new();
        assert!(reg.resize_stats().is_none());
        reg.insert_track(10.0);
        reg.insert_track(20.0);
        assert!(reg.resize_stats().is_none());
        assert_eq!(reg.track_stats().unwrap().mean, 15.0);
        reg.log_report();
    }
}
