//! Reading aggregation
//!
//! Display-side rollups, recomputed from scratch on every call:
//! - Time-of-day buckets for one calendar day
//! - Rolling 7-day class split, from persisted history for past days and
//!   from the live readings for today
//!
//! Today's split counts the class each reading got from the real-time
//! path. Recorded streams go through `classify_stream` first.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use std::collections::BTreeMap;

use crate::config::{AngleScale, FeatureConfig};
use crate::decision::{classify_sample, PostureProfile};
use crate::features::FeatureExtractor;
use crate::types::{
    AggregatedBucket, ClassifiedReading, DailySplit, DailySummary, Sample, SummarySource, TimeBlock,
};

/// Number of days in the rolling summary
pub const WEEK_DAYS: i64 = 7;

/// Stateless aggregator bound to an angle scale and local offset
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    scale: AngleScale,
    features: FeatureConfig,
    offset: FixedOffset,
}

impl Aggregator {
    pub fn new(scale: AngleScale, features: FeatureConfig, offset: FixedOffset) -> Self {
        Self {
            scale,
            features,
            offset,
        }
    }

    /// Local date and hour of a sample timestamp
    pub fn local_date_hour(&self, timestamp: i64) -> Option<(NaiveDate, u32)> {
        let at = DateTime::<Utc>::from_timestamp(timestamp, 0)?.with_timezone(&self.offset);
        Some((at.date_naive(), at.hour()))
    }

    /// Readings that fall on `date`, sorted by timestamp
    pub fn readings_on<'a, I>(&self, readings: I, date: NaiveDate) -> Vec<&'a Sample>
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let mut day: Vec<&Sample> = readings
            .into_iter()
            .filter(|s| matches!(self.local_date_hour(s.timestamp), Some((d, _)) if d == date))
            .collect();
        day.sort_by_key(|s| s.timestamp);
        day
    }

    /// One bucket per time-of-day block; empty blocks report zeros
    pub fn aggregated_view<'a, I>(&self, readings: I, date: NaiveDate) -> Vec<AggregatedBucket>
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let mut angles: BTreeMap<usize, Vec<f64>> = BTreeMap::new();

        for sample in self.readings_on(readings, date) {
            let Some((_, hour)) = self.local_date_hour(sample.timestamp) else {
                continue;
            };
            let Some(block) = TimeBlock::for_hour(hour) else {
                continue;
            };
            let index = TimeBlock::ALL
                .iter()
                .position(|b| *b == block)
                .unwrap_or_default();
            let angle = self.scale.to_angle(sample.raw_value).unwrap_or(0.0);
            angles.entry(index).or_default().push(angle);
        }

        TimeBlock::ALL
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let raw_values = angles.remove(&index).unwrap_or_default();
                let sample_count = raw_values.len();
                let average_value = if sample_count == 0 {
                    0.0
                } else {
                    raw_values.iter().sum::<f64>() / sample_count as f64
                };
                AggregatedBucket {
                    label: block.label().to_string(),
                    block: *block,
                    average_value,
                    sample_count,
                    raw_values,
                }
            })
            .collect()
    }

    /// Classify a recorded stream the way a session does on arrival
    ///
    /// The feature window runs over every reading in timestamp order, so a
    /// reading right after midnight still sees the readings before it.
    pub fn classify_stream(
        &self,
        readings: &[Sample],
        profile: &PostureProfile,
    ) -> Vec<ClassifiedReading> {
        let mut ordered: Vec<&Sample> = readings.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);

        let mut extractor = FeatureExtractor::new(self.scale, self.features);
        ordered
            .into_iter()
            .map(|sample| {
                let features = extractor.extract(sample);
                ClassifiedReading {
                    sample: sample.clone(),
                    class: classify_sample(profile, sample, &features).class,
                }
            })
            .collect()
    }

    /// Class counts for one day from already classified readings
    pub fn split_for_day(&self, readings: &[ClassifiedReading], date: NaiveDate) -> DailySplit {
        let mut split = DailySplit::default();
        for reading in readings {
            if matches!(self.local_date_hour(reading.sample.timestamp), Some((d, _)) if d == date) {
                split.record(reading.class);
            }
        }
        split
    }

    /// Rolling summary of the 7 days ending `today`, oldest first
    pub fn weekly_summary(
        &self,
        today: NaiveDate,
        history: &BTreeMap<String, DailySplit>,
        live_readings: &[ClassifiedReading],
    ) -> Vec<DailySummary> {
        (0..WEEK_DAYS)
            .rev()
            .map(|days_ago| {
                let date = today - Duration::days(days_ago);
                let key = date.format("%Y-%m-%d").to_string();

                let (split, source) = if days_ago == 0 {
                    let split = self.split_for_day(live_readings, date);
                    let source = if split.total() > 0 {
                        SummarySource::Live
                    } else {
                        SummarySource::Empty
                    };
                    (split, source)
                } else {
                    match history.get(&key) {
                        Some(split) => (*split, SummarySource::History),
                        None => (DailySplit::default(), SummarySource::Empty),
                    }
                };
                summarize(key, split, source)
            })
            .collect()
    }
}

fn summarize(date: String, split: DailySplit, source: SummarySource) -> DailySummary {
    let total = split.total();
    let pct = |count: u32| {
        if total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / total as f64
        }
    };
    DailySummary {
        date,
        good_pct: pct(split.good),
        warning_pct: pct(split.warning),
        bad_pct: pct(split.bad),
        sample_count: total,
        source,
    }
}
