//! Session orchestration
//!
//! This module provides the public API of Posture Flux. A `PostureSession`
//! owns every engine for one user and is driven by a single processing
//! context:
//! - `ingest()` runs a sample through features, classification, scoring and
//!   the alert gate, and retains it for aggregation
//! - `tick()` fires due timers (calibration countdowns, alert debounce and
//!   auto-dismiss)
//! - `pump_store_changes()` applies subscription pushes from the store
//!
//! `classify_samples()` is the stateless one-shot entry point.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::Aggregator;
use crate::calibration::{CalibrationEvent, CalibrationSession, CalibrationStateMachine};
use crate::config::PostureConfig;
use crate::decision::{classify_sample, DecisionTree, PostureProfile};
use crate::error::PostureError;
use crate::features::FeatureExtractor;
use crate::notify::{Alert, NotificationEvent, NotificationGate};
use crate::schema::SampleAdapter;
use crate::scoring::{IgnoreReason, ScoreOutcome, ScoringEngine};
use crate::store::{KeyValueStore, Namespace, StoreChange, StorePath};
use crate::types::{
    AggregatedBucket, Classification, ClassificationEvent, ClassifiedReading, DailySplit,
    DailySummary, Sample, ScoreState, Thresholds,
};

const SECS_PER_DAY: i64 = 86_400;

/// Result of ingesting one sample
///
/// Samples at or before the newest ingested timestamp are not classified:
/// `classification` is `None` and the score outcome is `Ignored`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub timestamp: i64,
    pub classification: Option<Classification>,
    pub score: ScoreOutcome,
}

/// Anything the shell may want to render after a tick or a store push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Calibration(CalibrationEvent),
    Notification(NotificationEvent),
    Ingested(IngestReport),
    ProfileReplaced { has_tree: bool },
}

/// Store subscriptions held by a session
struct Subscriptions {
    samples: Receiver<StoreChange>,
    calibrated: Receiver<StoreChange>,
    tree: Receiver<StoreChange>,
    thresholds: Receiver<StoreChange>,
}

impl Subscriptions {
    fn open(store: &dyn KeyValueStore, user_id: &str) -> Self {
        let path = |namespace: Namespace| StorePath::new(user_id, namespace);
        Self {
            samples: store.subscribe(&path(Namespace::Samples)),
            calibrated: store.subscribe(&path(Namespace::CalibrationFlag)),
            tree: store.subscribe(&path(Namespace::ModelTree)),
            thresholds: store.subscribe(&path(Namespace::ModelThresholds)),
        }
    }
}

/// Stateful posture engine for one user
pub struct PostureSession {
    session_id: Uuid,
    user_id: String,
    store: Arc<dyn KeyValueStore>,
    config: PostureConfig,
    profile: PostureProfile,
    extractor: FeatureExtractor,
    scoring: ScoringEngine,
    gate: NotificationGate,
    calibration: CalibrationStateMachine,
    aggregator: Aggregator,
    /// Readings kept for aggregation, in arrival order
    readings: Vec<ClassifiedReading>,
    daily_history: BTreeMap<String, DailySplit>,
    last_ingested: Option<i64>,
    skipped_records: u64,
    subscriptions: Subscriptions,
}

impl PostureSession {
    /// Open a session, loading profile, score, calibration and history state
    pub fn open(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: PostureConfig,
    ) -> Result<Self, PostureError> {
        config.validate()?;
        let user_id = user_id.into();
        let offset = config.utc_offset();

        let scoring = ScoringEngine::load(user_id.clone(), store.clone(), config.scoring, offset)?;
        let calibration =
            CalibrationStateMachine::load(user_id.clone(), store.clone(), config.calibration)?;
        let profile = load_stored_profile(store.as_ref(), &user_id, config.thresholds);
        let daily_history =
            match store.get(&StorePath::new(user_id.clone(), Namespace::DailyHistory))? {
                Some(value) => serde_json::from_value(value)?,
                None => BTreeMap::new(),
            };
        let subscriptions = Subscriptions::open(store.as_ref(), &user_id);

        let session = Self {
            session_id: Uuid::new_v4(),
            extractor: FeatureExtractor::new(config.angle, config.features),
            gate: NotificationGate::new(config.notification),
            aggregator: Aggregator::new(config.angle, config.features, offset),
            user_id,
            store,
            config,
            profile,
            scoring,
            calibration,
            readings: Vec::new(),
            daily_history,
            last_ingested: None,
            skipped_records: 0,
            subscriptions,
        };
        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            has_tree = session.profile.has_tree(),
            calibrated = session.calibration.is_calibrated(),
            "posture session opened"
        );
        Ok(session)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &PostureConfig {
        &self.config
    }

    pub fn profile(&self) -> &PostureProfile {
        &self.profile
    }

    pub fn score(&self) -> &ScoreState {
        self.scoring.state()
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub fn calibration(&self, now_ms: u64) -> CalibrationSession {
        self.calibration.snapshot(now_ms)
    }

    pub fn visible_alert(&self) -> Option<&Alert> {
        self.gate.visible()
    }

    /// Readings that were not numeric and were treated as angle 0
    pub fn invalid_samples(&self) -> u64 {
        self.extractor.invalid_samples()
    }

    /// Unusable records in the latest sample push
    pub fn skipped_records(&self) -> u64 {
        self.skipped_records
    }

    pub fn retained_readings(&self) -> usize {
        self.readings.len()
    }

    pub fn daily_history(&self) -> &BTreeMap<String, DailySplit> {
        &self.daily_history
    }

    // ── Classification and scoring ───────────────────────────────────

    /// Classify a sample, advancing the feature window but nothing else
    pub fn classify(&mut self, sample: &Sample) -> Classification {
        let features = self.extractor.extract(sample);
        classify_sample(&self.profile, sample, &features)
    }

    /// Full per-sample path: classify, score, alert, retain
    ///
    /// Only samples newer than every sample ingested so far are processed.
    pub fn ingest(&mut self, sample: Sample, now_ms: u64) -> IngestReport {
        let timestamp = sample.timestamp;
        if self.last_ingested.is_some_and(|last| timestamp <= last) {
            debug!(timestamp, "ignoring sample at or before the newest ingested");
            return IngestReport {
                timestamp,
                classification: None,
                score: ScoreOutcome::Ignored {
                    reason: IgnoreReason::OutOfOrder,
                },
            };
        }

        let classification = self.classify(&sample);
        let score = self.scoring.process(
            ClassificationEvent {
                timestamp,
                class: classification.class,
            },
            now_secs(now_ms),
        );
        self.gate
            .submit(classification.class, classification.confidence, now_ms);

        self.last_ingested = Some(timestamp);
        self.retain(ClassifiedReading {
            sample,
            class: classification.class,
        });

        debug!(
            timestamp,
            class = classification.class.as_str(),
            confidence = classification.confidence,
            dominant_feature = classification.dominant_feature_name(),
            ?score,
            "sample ingested"
        );
        IngestReport {
            timestamp,
            classification: Some(classification),
            score,
        }
    }

    pub fn on_score_update<F>(&mut self, callback: F)
    where
        F: FnMut(&ScoreState) + Send + 'static,
    {
        self.scoring.on_score_update(callback);
    }

    /// Retry persisting score state that failed to write earlier
    pub fn flush_score(&mut self) -> Result<(), PostureError> {
        if self.scoring.has_unpersisted_changes() {
            self.scoring.flush()?;
        }
        Ok(())
    }

    pub fn dismiss_alert(&mut self) -> Option<NotificationEvent> {
        self.gate.dismiss()
    }

    // ── Calibration ──────────────────────────────────────────────────

    pub fn start_calibration_step(
        &mut self,
        step: u8,
        now_ms: u64,
    ) -> Result<Vec<CalibrationEvent>, PostureError> {
        self.calibration.start_step(step, now_ms)
    }

    pub fn cancel_calibration(&mut self) -> Result<Vec<CalibrationEvent>, PostureError> {
        self.calibration.cancel()
    }

    /// Replace the classifier profile wholesale
    pub fn load_profile(&mut self, profile: PostureProfile) {
        info!(has_tree = profile.has_tree(), "posture profile replaced");
        self.profile = profile;
    }

    // ── Aggregation ──────────────────────────────────────────────────

    pub fn get_aggregated_view(&self, date: NaiveDate) -> Vec<AggregatedBucket> {
        self.aggregator
            .aggregated_view(self.readings.iter().map(|r| &r.sample), date)
    }

    /// Rolling 7 days ending `today`, oldest first
    pub fn get_weekly_summary(&self, today: NaiveDate) -> Vec<DailySummary> {
        self.aggregator
            .weekly_summary(today, &self.daily_history, &self.readings)
    }

    /// Roll the live readings of `date` into the persisted daily history
    pub fn close_day(&mut self, date: NaiveDate) -> Result<DailySplit, PostureError> {
        let split = self.aggregator.split_for_day(&self.readings, date);
        let key = date.format("%Y-%m-%d").to_string();
        self.daily_history.insert(key.clone(), split);

        let value = serde_json::to_value(&self.daily_history)?;
        self.store.set(
            &StorePath::new(self.user_id.clone(), Namespace::DailyHistory),
            value,
        )?;
        info!(date = %key, total = split.total(), "daily posture split persisted");
        Ok(split)
    }

    // ── Event loop ───────────────────────────────────────────────────

    /// Fire every timer due at `now_ms`
    pub fn tick(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events: Vec<SessionEvent> = self
            .calibration
            .tick(now_ms)
            .into_iter()
            .map(SessionEvent::Calibration)
            .collect();
        events.extend(
            self.gate
                .tick(now_ms)
                .into_iter()
                .map(SessionEvent::Notification),
        );
        if self.scoring.has_unpersisted_changes() {
            // Failure is already recorded on the engine
            let _ = self.scoring.flush();
        }
        events
    }

    /// Apply pending store pushes: calibrated flag, model and new samples
    pub fn pump_store_changes(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        while let Ok(change) = self.subscriptions.calibrated.try_recv() {
            let calibrated = change.value.as_bool().unwrap_or(false);
            if let Some(event) = self.calibration.on_calibrated_changed(calibrated) {
                events.push(SessionEvent::Calibration(event));
            }
        }

        let mut model_changed = false;
        while self.subscriptions.tree.try_recv().is_ok() {
            model_changed = true;
        }
        while self.subscriptions.thresholds.try_recv().is_ok() {
            model_changed = true;
        }
        if model_changed {
            let profile =
                load_stored_profile(self.store.as_ref(), &self.user_id, self.config.thresholds);
            events.push(SessionEvent::ProfileReplaced {
                has_tree: profile.has_tree(),
            });
            self.load_profile(profile);
        }

        while let Ok(change) = self.subscriptions.samples.try_recv() {
            let batch = match SampleAdapter::parse_feed(&change.value) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable sample push");
                    continue;
                }
            };
            let skipped = batch.skipped as u64;
            if skipped > self.skipped_records {
                warn!(skipped, "sample push contains unusable records");
            }
            self.skipped_records = skipped;
            for sample in batch.samples {
                if self.last_ingested.is_some_and(|last| sample.timestamp <= last) {
                    continue;
                }
                events.push(SessionEvent::Ingested(self.ingest(sample, now_ms)));
            }
        }
        events
    }

    /// Cancel all timers, clear the outstanding calibration command and
    /// write any unpersisted score state
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub fn teardown(&mut self) -> Result<(), PostureError> {
        self.gate.teardown();
        let flushed = self.flush_score();
        let cleared = self.calibration.teardown();
        let result = flushed.and(cleared);
        info!(session_id = %self.session_id, ok = result.is_ok(), "posture session torn down");
        result
    }

    fn retain(&mut self, reading: ClassifiedReading) {
        let newest = self.last_ingested.unwrap_or(reading.sample.timestamp);
        self.readings.push(reading);

        let horizon = newest - i64::from(self.config.retention_days) * SECS_PER_DAY;
        if self
            .readings
            .first()
            .is_some_and(|r| r.sample.timestamp < horizon)
        {
            self.readings.retain(|r| r.sample.timestamp >= horizon);
        }
    }
}

/// Read the profile from `model/tree` + `model/thresholds`, falling back
/// to `defaults` for anything missing or malformed
fn load_stored_profile(
    store: &dyn KeyValueStore,
    user_id: &str,
    defaults: Thresholds,
) -> PostureProfile {
    let read = |namespace: Namespace| match store.get(&StorePath::new(user_id, namespace)) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, namespace = namespace.as_str(), "failed to read posture model");
            None
        }
    };

    let thresholds = read(Namespace::ModelThresholds)
        .and_then(|value| serde_json::from_value::<Thresholds>(value).ok())
        .filter(|t| t.validate().is_ok())
        .unwrap_or(defaults);
    let tree = read(Namespace::ModelTree).and_then(|value| match parse_tree(value) {
        Ok(tree) => Some(tree),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable decision tree");
            None
        }
    });

    PostureProfile::new(tree, thresholds)
        .unwrap_or_else(|_| PostureProfile::with_thresholds(defaults))
}

/// Trees are stored either as `{"nodes": [...]}` or as the bare node array
fn parse_tree(value: Value) -> Result<DecisionTree, PostureError> {
    match value {
        Value::Array(_) => Ok(DecisionTree::new(serde_json::from_value(value)?)),
        other => Ok(serde_json::from_value(other)?),
    }
}

fn now_secs(now_ms: u64) -> i64 {
    i64::try_from(now_ms / 1000).unwrap_or(i64::MAX)
}

/// Classify a JSON array of samples in one shot, without a session
///
/// Returns one classification per sample, in input order.
pub fn classify_samples(
    samples_json: &str,
    profile: &PostureProfile,
    config: &PostureConfig,
) -> Result<Vec<Classification>, PostureError> {
    let samples = SampleAdapter::parse_array(samples_json)?;
    let mut extractor = FeatureExtractor::new(config.angle, config.features);
    Ok(samples
        .iter()
        .map(|sample| {
            let features = extractor.extract(sample);
            classify_sample(profile, sample, &features)
        })
        .collect())
}

/// Local calendar date of `now_ms` under the configured offset
pub fn local_today(now_ms: u64, offset: FixedOffset) -> NaiveDate {
    DateTime::<Utc>::from_timestamp(now_secs(now_ms), 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .with_timezone(&offset)
        .date_naive()
}
