//! Error types for Posture Flux

use thiserror::Error;

/// Errors that can occur while classifying, calibrating or scoring
#[derive(Debug, Error)]
pub enum PostureError {
    #[error("Failed to parse sample payload: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),

    #[error("Invalid calibration step: {0}")]
    InvalidStep(u8),

    #[error("Calibration step {active} is still counting down")]
    StepInProgress { active: u8 },

    #[error("Calibration step {step} needs step {missing} to be completed first")]
    StepOutOfOrder { step: u8, missing: u8 },

    #[error("Calibration step {0} was triggered again too quickly")]
    Debounced(u8),

    #[error("Store write failed for {path}: {reason}")]
    StoreWrite { path: String, reason: String },

    #[error("Store read failed for {path}: {reason}")]
    StoreRead { path: String, reason: String },

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PostureError {
    /// Whether the failure came from the external store and may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PostureError::StoreWrite { .. } | PostureError::StoreRead { .. }
        )
    }
}
