//! Adapter for converting posture.sample.v1 payloads into engine samples

use serde_json::Value;
use tracing::debug;

use crate::error::PostureError;
use crate::schema::sample_record::{raw_to_f64, SampleRecord};
use crate::types::Sample;

/// Samples read from a store push, plus the records that were unusable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    pub samples: Vec<Sample>,
    pub skipped: usize,
}

/// Adapter for parsing sample feeds
pub struct SampleAdapter;

impl SampleAdapter {
    /// Parse a JSON array of sample records
    pub fn parse_array(json: &str) -> Result<Vec<Sample>, PostureError> {
        let records: Vec<SampleRecord> = serde_json::from_str(json)?;
        Self::convert(records)
    }

    /// Parse NDJSON (newline-delimited JSON) sample records
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<Sample>, PostureError> {
        let mut records = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<SampleRecord>(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    return Err(PostureError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Self::convert(records)
    }

    /// Parse the store's timestamp-keyed layout: `{"<secs>": <raw value>, ...}`
    pub fn parse_keyed(value: &Value) -> Result<Vec<Sample>, PostureError> {
        let Value::Object(entries) = value else {
            return Err(PostureError::ParseError(
                "expected an object keyed by timestamp".to_string(),
            ));
        };
        let mut samples = entries
            .iter()
            .map(|(key, raw)| Self::keyed_entry(key, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Self::sort_by_timestamp(&mut samples);
        Ok(samples)
    }

    /// Parse a store push record by record
    ///
    /// Accepts a record array or the timestamp-keyed map. A record that
    /// cannot become a sample is counted in `skipped`; the rest still load.
    /// Only a payload of the wrong shape is an error.
    pub fn parse_feed(value: &Value) -> Result<FeedBatch, PostureError> {
        let results: Vec<Result<Sample, PostureError>> = match value {
            Value::Array(items) => items.iter().map(Self::record_entry).collect(),
            Value::Object(entries) => entries
                .iter()
                .map(|(key, raw)| Self::keyed_entry(key, raw))
                .collect(),
            _ => {
                return Err(PostureError::ParseError(
                    "expected a record array or an object keyed by timestamp".to_string(),
                ))
            }
        };

        let mut batch = FeedBatch::default();
        for result in results {
            match result {
                Ok(sample) => batch.samples.push(sample),
                Err(e) => {
                    debug!(error = %e, "skipping unusable sample record");
                    batch.skipped += 1;
                }
            }
        }
        Self::sort_by_timestamp(&mut batch.samples);
        Ok(batch)
    }

    /// Stable sort so equal timestamps keep feed order
    pub fn sort_by_timestamp(samples: &mut [Sample]) {
        samples.sort_by_key(|s| s.timestamp);
    }

    fn record_entry(item: &Value) -> Result<Sample, PostureError> {
        let record: SampleRecord = serde_json::from_value(item.clone())?;
        record.validate()?;
        Ok(record.to_sample())
    }

    fn keyed_entry(key: &str, raw: &Value) -> Result<Sample, PostureError> {
        let timestamp: i64 = key.parse().map_err(|_| {
            PostureError::ParseError(format!("sample key is not a timestamp: {key}"))
        })?;
        match raw {
            Value::Object(_) => {
                let mut record: SampleRecord = serde_json::from_value(raw.clone())?;
                record.timestamp = timestamp;
                record.validate()?;
                Ok(record.to_sample())
            }
            other => Ok(Sample::new(timestamp, raw_to_f64(other))),
        }
    }

    fn convert(records: Vec<SampleRecord>) -> Result<Vec<Sample>, PostureError> {
        let mut samples = Vec::with_capacity(records.len());
        for record in records {
            record.validate()?;
            samples.push(record.to_sample());
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ndjson() {
        let input = r#"
{"timestamp": 1, "rawValue": 2.0}

{"timestamp": 2, "rawValue": "oops"}
"#;
        let samples = SampleAdapter::parse_ndjson(input).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].raw_value, 2.0);
        assert!(samples[1].raw_value.is_nan());
    }

    #[test]
    fn test_parse_ndjson_reports_line() {
        let err = SampleAdapter::parse_ndjson("{\"timestamp\": 1}\nnot json").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_array_validates() {
        let err = SampleAdapter::parse_array(r#"[{"timestamp": -5, "rawValue": 1}]"#).unwrap_err();
        assert!(matches!(err, PostureError::ParseError(_)));
    }

    #[test]
    fn test_parse_keyed_sorts() {
        let feed = json!({
            "30": 5.0,
            "10": "7",
            "20": {"rawValue": 1.0, "prediction": "good", "confidence": 0.9}
        });
        let samples = SampleAdapter::parse_keyed(&feed).unwrap();
        let timestamps: Vec<i64> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert_eq!(samples[0].raw_value, 7.0);
        assert!(samples[1].prediction.is_some());
    }

    #[test]
    fn test_parse_feed_skips_unusable_records() {
        let feed = json!([
            {"timestamp": 12, "rawValue": 3, "prediction": "good", "confidence": 1.2},
            {"timestamp": -1, "rawValue": 4},
            {"rawValue": 5},
            {"timestamp": 11, "rawValue": "6"},
            {"timestamp": 13, "rawValue": 7}
        ]);
        let batch = SampleAdapter::parse_feed(&feed).unwrap();
        let timestamps: Vec<i64> = batch.samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![11, 12, 13]);
        assert_eq!(batch.samples[1].prediction, None);
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn test_parse_feed_keyed_skips_bad_keys() {
        let batch = SampleAdapter::parse_feed(&json!({"soon": 1, "5": 2.0})).unwrap();
        assert_eq!(batch.samples, vec![Sample::new(5, 2.0)]);
        assert_eq!(batch.skipped, 1);
        assert!(SampleAdapter::parse_feed(&json!("nope")).is_err());
    }

    #[test]
    fn test_parse_keyed_rejects_bad_keys() {
        assert!(SampleAdapter::parse_keyed(&json!({"soon": 1})).is_err());
        assert!(SampleAdapter::parse_keyed(&json!([1, 2])).is_err());
    }
}
