//! posture.sample.v1 schema
//!
//! This module defines the wire format of the sensor sample feed and the
//! adapter that turns it into engine samples. Raw values are accepted
//! leniently: numbers and numeric strings are used as-is, anything else is
//! carried as NaN so the feature extractor can count it.

mod adapter;
mod sample_record;

pub use adapter::*;
pub use sample_record::*;
