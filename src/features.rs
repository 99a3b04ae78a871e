//! Feature extraction
//!
//! This module turns the raw sample stream into feature vectors:
//! - Trailing-window mean, variance and range of the pitch angle
//! - Angular velocity between consecutive samples
//! - Exponentially weighted moving average of the angle
//!
//! Non-numeric samples are treated as angle 0 and counted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::{AngleScale, FeatureConfig};
use crate::types::{FeatureVector, Sample};

/// Stateful extractor over an ordered sample stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureExtractor {
    scale: AngleScale,
    config: FeatureConfig,
    /// Trailing window of angles (degrees)
    window: VecDeque<f64>,
    /// Timestamp and angle of the previous sample
    previous: Option<(i64, f64)>,
    ewma: Option<f64>,
    /// Samples whose raw value was not a number
    invalid_samples: u64,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(AngleScale::default(), FeatureConfig::default())
    }
}

impl FeatureExtractor {
    pub fn new(scale: AngleScale, config: FeatureConfig) -> Self {
        Self {
            scale,
            config,
            window: VecDeque::with_capacity(config.window_size),
            previous: None,
            ewma: None,
            invalid_samples: 0,
        }
    }

    /// Convert a sample's raw value to an angle, defaulting to 0 for junk input
    pub fn angle_of(&mut self, sample: &Sample) -> f64 {
        match self.scale.to_angle(sample.raw_value) {
            Some(angle) => angle,
            None => {
                self.invalid_samples += 1;
                warn!(
                    timestamp = sample.timestamp,
                    invalid_samples = self.invalid_samples,
                    "non-numeric raw sample, using angle 0"
                );
                0.0
            }
        }
    }

    /// Push a sample and compute its feature vector
    pub fn extract(&mut self, sample: &Sample) -> FeatureVector {
        let angle = self.angle_of(sample);

        self.window.push_back(angle);
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }

        let angular_velocity = match self.previous {
            Some((prev_ts, prev_angle)) => {
                let dt = sample.timestamp - prev_ts;
                if dt > 0 {
                    (angle - prev_angle).abs() / dt as f64
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.previous = Some((sample.timestamp, angle));

        let alpha = self.config.ewma_alpha;
        let ewma = match self.ewma {
            Some(prev) => alpha * angle + (1.0 - alpha) * prev,
            None => angle,
        };
        self.ewma = Some(ewma);

        let (mean, variance, range) = window_stats(&self.window);

        let features = FeatureVector {
            mean,
            variance,
            range,
            angular_velocity,
            ewma,
            angle,
        };
        debug!(timestamp = sample.timestamp, ?features, "extracted features");
        features
    }

    /// Number of samples that fell back to angle 0
    pub fn invalid_samples(&self) -> u64 {
        self.invalid_samples
    }

    /// Forget the window and EWMA seed, keeping the invalid-sample counter
    pub fn reset(&mut self) {
        self.window.clear();
        self.previous = None;
        self.ewma = None;
    }
}

/// Mean, population variance and range of the window
fn window_stats(window: &VecDeque<f64>) -> (f64, f64, f64) {
    if window.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    if window.len() < 2 {
        return (mean, 0.0, 0.0);
    }
    let variance = window.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    let min = window.iter().copied().fold(f64::INFINITY, f64::min);
    let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (mean, variance, max - min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(window_size: usize) -> FeatureExtractor {
        FeatureExtractor::new(
            AngleScale::default(),
            FeatureConfig {
                window_size,
                ewma_alpha: 0.3,
            },
        )
    }

    #[test]
    fn test_single_sample_has_no_spread() {
        let mut fx = extractor(10);
        let features = fx.extract(&Sample::new(100, 12.0));
        assert_eq!(features.mean, 12.0);
        assert_eq!(features.variance, 0.0);
        assert_eq!(features.range, 0.0);
        assert_eq!(features.angular_velocity, 0.0);
        // EWMA is seeded with the first angle
        assert_eq!(features.ewma, 12.0);
    }

    #[test]
    fn test_window_statistics() {
        let mut fx = extractor(10);
        let mut last = FeatureVector::default();
        for (i, angle) in [2.0, 4.0, 6.0].iter().enumerate() {
            last = fx.extract(&Sample::new(i as i64, *angle));
        }
        assert!((last.mean - 4.0).abs() < 1e-9);
        // ((−2)² + 0 + 2²) / 3
        assert!((last.variance - 8.0 / 3.0).abs() < 1e-9);
        assert_eq!(last.range, 4.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut fx = extractor(3);
        let mut last = FeatureVector::default();
        for (i, angle) in [100.0, 1.0, 2.0, 3.0].iter().enumerate() {
            last = fx.extract(&Sample::new(i as i64, *angle));
        }
        // 90 (clamped 100) has left the window
        assert!((last.mean - 2.0).abs() < 1e-9);
        assert_eq!(last.range, 2.0);
    }

    #[test]
    fn test_angular_velocity() {
        let mut fx = extractor(10);
        fx.extract(&Sample::new(10, 5.0));
        let features = fx.extract(&Sample::new(12, 11.0));
        assert!((features.angular_velocity - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_angular_velocity_zero_dt() {
        let mut fx = extractor(10);
        fx.extract(&Sample::new(10, 5.0));
        let features = fx.extract(&Sample::new(10, 50.0));
        assert_eq!(features.angular_velocity, 0.0);
    }

    #[test]
    fn test_ewma_update() {
        let mut fx = extractor(10);
        fx.extract(&Sample::new(0, 10.0));
        let features = fx.extract(&Sample::new(1, 20.0));
        // 0.3 * 20 + 0.7 * 10
        assert!((features.ewma - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_sample_counts_as_zero() {
        let mut fx = extractor(10);
        let features = fx.extract(&Sample::new(0, f64::NAN));
        assert_eq!(features.angle, 0.0);
        assert_eq!(fx.invalid_samples(), 1);

        fx.extract(&Sample::new(1, f64::INFINITY));
        assert_eq!(fx.invalid_samples(), 2);
    }

    #[test]
    fn test_reset_reseeds_ewma() {
        let mut fx = extractor(10);
        fx.extract(&Sample::new(0, 10.0));
        fx.reset();
        let features = fx.extract(&Sample::new(1, 30.0));
        assert_eq!(features.ewma, 30.0);
        assert_eq!(features.angular_velocity, 0.0);
    }
}
