//! Core types for the Posture Flux engines
//!
//! This module defines the data structures that flow between the engines:
//! raw samples, feature vectors, classifications, score state and the
//! display-ready aggregates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::PostureError;

/// Number of features a decision tree may branch on
pub const FEATURE_COUNT: usize = 5;

/// Feature names in branch-index order
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] =
    ["mean", "variance", "range", "angular_velocity", "ewma"];

/// Posture class, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostureClass {
    Good,
    Warning,
    Bad,
}

impl PostureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostureClass::Good => "good",
            PostureClass::Warning => "warning",
            PostureClass::Bad => "bad",
        }
    }

    /// Parse the lowercase or capitalized class name used by device payloads
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "good" => Some(PostureClass::Good),
            "warning" => Some(PostureClass::Warning),
            "bad" => Some(PostureClass::Bad),
            _ => None,
        }
    }
}

/// Prediction attached to a sample by the device firmware
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DevicePrediction {
    pub class: PostureClass,
    pub confidence: f64,
}

/// A single orientation reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    /// Raw sensor scalar; NaN when the payload was not numeric
    pub raw_value: f64,
    /// Optional on-device prediction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<DevicePrediction>,
}

impl Sample {
    pub fn new(timestamp: i64, raw_value: f64) -> Self {
        Self {
            timestamp,
            raw_value,
            prediction: None,
        }
    }

    pub fn with_prediction(mut self, class: PostureClass, confidence: f64) -> Self {
        self.prediction = Some(DevicePrediction { class, confidence });
        self
    }
}

/// Features derived from the trailing window of readings
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureVector {
    pub mean: f64,
    pub variance: f64,
    pub range: f64,
    pub angular_velocity: f64,
    pub ewma: f64,
    /// Instantaneous angle of the newest sample (degrees)
    pub angle: f64,
}

impl FeatureVector {
    /// Look up a feature by decision-tree branch index
    pub fn get(&self, index: usize) -> Option<f64> {
        match index {
            0 => Some(self.mean),
            1 => Some(self.variance),
            2 => Some(self.range),
            3 => Some(self.angular_velocity),
            4 => Some(self.ewma),
            _ => None,
        }
    }
}

/// Where a classification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Tree,
    Thresholds,
    Device,
}

/// Result of evaluating a feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: PostureClass,
    pub confidence: f64,
    /// Feature index most recently branched on (tree evaluation only)
    pub dominant_feature: Option<usize>,
    pub source: ClassificationSource,
}

impl Classification {
    /// Name of the dominant feature, for display
    pub fn dominant_feature_name(&self) -> Option<&'static str> {
        self.dominant_feature
            .and_then(|index| FEATURE_NAMES.get(index).copied())
    }
}

/// A reading kept for aggregation, with the class it got on arrival
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedReading {
    pub sample: Sample,
    pub class: PostureClass,
}

/// Classification tagged with the timestamp of the sample it came from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEvent {
    pub timestamp: i64,
    pub class: PostureClass,
}

/// Flat fallback thresholds (degrees), `good < warning < bad`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub good: f64,
    pub warning: f64,
    pub bad: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            good: 8.0,
            warning: 15.0,
            bad: 25.0,
        }
    }
}

impl Thresholds {
    pub fn new(good: f64, warning: f64, bad: f64) -> Result<Self, PostureError> {
        let thresholds = Self { good, warning, bad };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), PostureError> {
        if !(self.good.is_finite() && self.warning.is_finite() && self.bad.is_finite()) {
            return Err(PostureError::InvalidThresholds(
                "thresholds must be finite".to_string(),
            ));
        }
        if !(self.good < self.warning && self.warning < self.bad) {
            return Err(PostureError::InvalidThresholds(format!(
                "expected good < warning < bad, got {} / {} / {}",
                self.good, self.warning, self.bad
            )));
        }
        Ok(())
    }
}

/// Current and best streak of point awards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Streak {
    pub current: u32,
    pub longest: u32,
}

/// Kind of history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    GoodPosture,
    Achievement,
}

/// One-shot milestones unlocked by the scoring engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    FirstPoint,
    TenPoints,
    HundredPoints,
    StreakOfFive,
    StreakOfTwenty,
}

impl Achievement {
    pub const ALL: [Achievement; 5] = [
        Achievement::FirstPoint,
        Achievement::TenPoints,
        Achievement::HundredPoints,
        Achievement::StreakOfFive,
        Achievement::StreakOfTwenty,
    ];

    pub fn is_earned(&self, points: u64, streak: &Streak) -> bool {
        match self {
            Achievement::FirstPoint => points >= 1,
            Achievement::TenPoints => points >= 10,
            Achievement::HundredPoints => points >= 100,
            Achievement::StreakOfFive => streak.current >= 5,
            Achievement::StreakOfTwenty => streak.current >= 20,
        }
    }
}

/// Append-only score history record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Local calendar date (YYYY-MM-DD)
    pub date: String,
    /// Local time of day (HH:MM:SS)
    pub time: String,
    pub points: u32,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievement: Option<Achievement>,
}

/// Persistent gamification state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoreState {
    pub points: u64,
    /// Length of the current run of Good classifications
    pub consecutive_good_count: u32,
    pub streak: Streak,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub achievements: BTreeSet<Achievement>,
}

/// Time-of-day block used by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBlock {
    Morning,
    Midday,
    Afternoon,
    Evening,
}

impl TimeBlock {
    pub const ALL: [TimeBlock; 4] = [
        TimeBlock::Morning,
        TimeBlock::Midday,
        TimeBlock::Afternoon,
        TimeBlock::Evening,
    ];

    /// Half-open hour range `[start, end)` covered by the block
    pub fn hours(&self) -> (u32, u32) {
        match self {
            TimeBlock::Morning => (6, 11),
            TimeBlock::Midday => (11, 15),
            TimeBlock::Afternoon => (15, 19),
            TimeBlock::Evening => (19, 24),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeBlock::Morning => "Morning",
            TimeBlock::Midday => "Midday",
            TimeBlock::Afternoon => "Afternoon",
            TimeBlock::Evening => "Evening",
        }
    }

    pub fn for_hour(hour: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|block| {
            let (start, end) = block.hours();
            hour >= start && hour < end
        })
    }
}

/// Display-ready summary of one time-of-day block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBucket {
    pub label: String,
    pub block: TimeBlock,
    pub average_value: f64,
    pub sample_count: usize,
    pub raw_values: Vec<f64>,
}

/// Per-day class counts, as persisted by the daily rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DailySplit {
    pub good: u32,
    pub warning: u32,
    pub bad: u32,
}

impl DailySplit {
    pub fn record(&mut self, class: PostureClass) {
        match class {
            PostureClass::Good => self.good += 1,
            PostureClass::Warning => self.warning += 1,
            PostureClass::Bad => self.bad += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.good + self.warning + self.bad
    }
}

/// Where a weekly summary row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    History,
    Live,
    Empty,
}

/// One row of the rolling 7-day summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: String,
    pub good_pct: f64,
    pub warning_pct: f64,
    pub bad_pct: f64,
    pub sample_count: u32,
    pub source: SummarySource,
}
