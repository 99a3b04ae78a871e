//! posture.sample.v1 record definition

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::PostureError;
use crate::types::{FeatureVector, PostureClass, Sample};

/// Current schema version
pub const SCHEMA_VERSION: &str = "posture.sample.v1";

/// One sample as pushed by the device into the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRecord {
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    /// Raw sensor scalar; may be a number, a numeric string or junk
    #[serde(alias = "raw_value", alias = "value", default)]
    pub raw_value: Value,
    /// On-device class prediction (`good`, `warning` or `bad`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<String>,
    /// Confidence of the on-device prediction (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Features computed on the device; kept for diagnostics, the engine
    /// always derives its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureVector>,
}

impl SampleRecord {
    /// Reject records that cannot become a sample at all
    pub fn validate(&self) -> Result<(), PostureError> {
        if self.timestamp < 0 {
            return Err(PostureError::ParseError(format!(
                "negative timestamp {}",
                self.timestamp
            )));
        }
        Ok(())
    }

    /// Numeric view of the raw value; NaN when it is not a number
    pub fn numeric_value(&self) -> f64 {
        raw_to_f64(&self.raw_value)
    }

    /// Convert to an engine sample
    ///
    /// The device prediction is attached only when the class parses and the
    /// confidence lies in [0, 1]; otherwise the sample is kept without it.
    pub fn to_sample(&self) -> Sample {
        let sample = Sample::new(self.timestamp, self.numeric_value());
        match (
            self.prediction.as_deref().and_then(PostureClass::parse),
            self.confidence,
        ) {
            (Some(class), Some(confidence)) if (0.0..=1.0).contains(&confidence) => {
                sample.with_prediction(class, confidence)
            }
            (Some(_), Some(confidence)) => {
                debug!(
                    timestamp = self.timestamp,
                    confidence, "dropping device prediction with out-of-range confidence"
                );
                sample
            }
            _ => sample,
        }
    }
}

/// Lenient numeric conversion used for every raw value
pub fn raw_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}
