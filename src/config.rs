//! Engine configuration
//!
//! Every constant the engines depend on lives here with its default. Configs
//! are plain serde structs so an application shell can ship them as JSON;
//! missing fields fall back to the defaults.

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PostureError;
use crate::types::Thresholds;

/// Linear mapping from the raw sensor scalar to a pitch angle in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AngleScale {
    pub gain: f64,
    pub offset: f64,
    /// Angles are clamped to `[-max_abs_degrees, max_abs_degrees]`
    pub max_abs_degrees: f64,
}

impl Default for AngleScale {
    fn default() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
            max_abs_degrees: 90.0,
        }
    }
}

impl AngleScale {
    /// Convert a raw value to a clamped angle, or `None` if it is not a number
    pub fn to_angle(&self, raw: f64) -> Option<f64> {
        if !raw.is_finite() {
            return None;
        }
        let angle = raw * self.gain + self.offset;
        if !angle.is_finite() {
            return None;
        }
        Some(angle.clamp(-self.max_abs_degrees, self.max_abs_degrees))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Trailing window length for mean/variance/range
    pub window_size: usize,
    /// EWMA smoothing factor in (0, 1]
    pub ewma_alpha: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            ewma_alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Consecutive Good classifications required for one award
    pub good_run_length: u32,
    /// Events older than this relative to "now" are ignored
    pub stale_after_secs: i64,
    pub points_per_award: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            good_run_length: 30,
            stale_after_secs: 180,
            points_per_award: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Minimum dwell time per calibration posture
    pub step_duration_secs: u64,
    /// Repeated triggers inside this window are rejected
    pub debounce_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            step_duration_secs: 15,
            debounce_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub debounce_ms: u64,
    pub auto_dismiss_ms: u64,
    /// Warnings alert only above this confidence
    pub warning_confidence: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            auto_dismiss_ms: 5000,
            warning_confidence: 0.7,
        }
    }
}

/// Top-level configuration for a posture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    pub angle: AngleScale,
    pub features: FeatureConfig,
    pub scoring: ScoringConfig,
    pub calibration: CalibrationConfig,
    pub notification: NotificationConfig,
    /// Fallback thresholds used until a calibrated profile is loaded
    pub thresholds: Thresholds,
    /// Fixed offset used to map timestamps to local dates and blocks
    pub utc_offset_minutes: i32,
    /// Days of raw readings kept in memory for aggregation
    pub retention_days: u32,
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            angle: AngleScale::default(),
            features: FeatureConfig::default(),
            scoring: ScoringConfig::default(),
            calibration: CalibrationConfig::default(),
            notification: NotificationConfig::default(),
            thresholds: Thresholds::default(),
            utc_offset_minutes: 0,
            retention_days: 8,
        }
    }
}

impl PostureConfig {
    /// Load a configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self, PostureError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON
    pub fn to_json(&self) -> Result<String, PostureError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), PostureError> {
        if self.features.window_size == 0 {
            return Err(PostureError::ConfigError(
                "features.window_size must be at least 1".to_string(),
            ));
        }
        let alpha = self.features.ewma_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(PostureError::ConfigError(format!(
                "features.ewma_alpha must be in (0, 1], got {alpha}"
            )));
        }
        if !self.angle.gain.is_finite() || self.angle.gain == 0.0 {
            return Err(PostureError::ConfigError(
                "angle.gain must be finite and non-zero".to_string(),
            ));
        }
        if self.scoring.good_run_length == 0 {
            return Err(PostureError::ConfigError(
                "scoring.good_run_length must be at least 1".to_string(),
            ));
        }
        if self.scoring.stale_after_secs < 0 {
            return Err(PostureError::ConfigError(
                "scoring.stale_after_secs must not be negative".to_string(),
            ));
        }
        if self.calibration.step_duration_secs == 0 {
            return Err(PostureError::ConfigError(
                "calibration.step_duration_secs must be at least 1".to_string(),
            ));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(PostureError::ConfigError(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        self.thresholds.validate()
    }

    /// The configured fixed offset as a chrono timezone
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or(Utc.fix())
    }
}
