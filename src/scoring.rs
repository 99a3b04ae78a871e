//! Scoring engine
//!
//! Converts the classification stream into points, streaks and achievements:
//! - Events must be strictly newer than the last processed one and no older
//!   than the staleness window; everything else is dropped silently
//! - Good extends the run, Warning holds it, Bad resets it
//! - A full run awards points, extends the streak and appends history
//!
//! `streak.current` is never decayed here. Bad posture only resets the run
//! counter; expiring streaks across days belongs to an external rollup.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ScoringConfig;
use crate::error::PostureError;
use crate::store::{KeyValueStore, Namespace, StorePath};
use crate::types::{
    Achievement, ClassificationEvent, HistoryEntry, HistoryKind, PostureClass, ScoreState,
};

/// Why an event was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    Stale,
    OutOfOrder,
}

/// Effect of one classification event on the score state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScoreOutcome {
    Ignored {
        reason: IgnoreReason,
    },
    Counted {
        consecutive_good: u32,
    },
    Held {
        consecutive_good: u32,
    },
    Reset,
    Awarded {
        points: u64,
        persisted: bool,
        achievements: Vec<Achievement>,
    },
}

type ScoreListener = Box<dyn FnMut(&ScoreState) + Send>;

pub struct ScoringEngine {
    user_id: String,
    store: Arc<dyn KeyValueStore>,
    config: ScoringConfig,
    utc_offset: FixedOffset,
    state: ScoreState,
    last_processed: Option<i64>,
    /// State changed since the last successful write
    dirty: bool,
    last_error: Option<String>,
    listeners: Vec<ScoreListener>,
}

impl ScoringEngine {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: ScoringConfig,
        utc_offset: FixedOffset,
    ) -> Self {
        Self::with_state(user_id, store, config, utc_offset, ScoreState::default())
    }

    pub fn with_state(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: ScoringConfig,
        utc_offset: FixedOffset,
        state: ScoreState,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            config,
            utc_offset,
            state: repair(state, config.good_run_length),
            last_processed: None,
            dirty: false,
            last_error: None,
            listeners: Vec::new(),
        }
    }

    /// Load persisted score state once at session start
    pub fn load(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: ScoringConfig,
        utc_offset: FixedOffset,
    ) -> Result<Self, PostureError> {
        let user_id = user_id.into();
        let path = StorePath::new(user_id.clone(), Namespace::Score);
        let state = match store.get(&path)? {
            Some(value) => serde_json::from_value(value)?,
            None => ScoreState::default(),
        };
        Ok(Self::with_state(user_id, store, config, utc_offset, state))
    }

    pub fn state(&self) -> &ScoreState {
        &self.state
    }

    pub fn last_processed(&self) -> Option<i64> {
        self.last_processed
    }

    pub fn has_unpersisted_changes(&self) -> bool {
        self.dirty
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Register a callback invoked after every state change
    pub fn on_score_update<F>(&mut self, callback: F)
    where
        F: FnMut(&ScoreState) + Send + 'static,
    {
        self.listeners.push(Box::new(callback));
    }

    /// Apply one classification event, with `now_secs` as the staleness reference
    pub fn process(&mut self, event: ClassificationEvent, now_secs: i64) -> ScoreOutcome {
        if event.timestamp < now_secs - self.config.stale_after_secs {
            debug!(timestamp = event.timestamp, now_secs, "dropping stale event");
            return ScoreOutcome::Ignored {
                reason: IgnoreReason::Stale,
            };
        }
        if let Some(last) = self.last_processed {
            if event.timestamp <= last {
                debug!(timestamp = event.timestamp, last, "dropping out-of-order event");
                return ScoreOutcome::Ignored {
                    reason: IgnoreReason::OutOfOrder,
                };
            }
        }
        self.last_processed = Some(event.timestamp);

        if self.dirty {
            self.flush().ok();
        }

        let outcome = match event.class {
            PostureClass::Good => {
                self.state.consecutive_good_count += 1;
                if self.state.consecutive_good_count >= self.config.good_run_length {
                    self.award(event.timestamp)
                } else {
                    ScoreOutcome::Counted {
                        consecutive_good: self.state.consecutive_good_count,
                    }
                }
            }
            PostureClass::Warning => ScoreOutcome::Held {
                consecutive_good: self.state.consecutive_good_count,
            },
            PostureClass::Bad => {
                self.state.consecutive_good_count = 0;
                ScoreOutcome::Reset
            }
        };

        self.notify();
        outcome
    }

    /// Write the score state to the store
    pub fn flush(&mut self) -> Result<(), PostureError> {
        let value = serde_json::to_value(&self.state)?;
        match self
            .store
            .set(&StorePath::new(self.user_id.clone(), Namespace::Score), value)
        {
            Ok(()) => {
                self.dirty = false;
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                self.last_error = Some(e.to_string());
                warn!(error = %e, "failed to persist score state, keeping it in memory");
                Err(e)
            }
        }
    }

    /// Explicitly end the current streak (external daily rollup)
    pub fn reset_current_streak(&mut self) -> Result<(), PostureError> {
        self.state.streak.current = 0;
        self.notify();
        self.flush()
    }

    fn award(&mut self, timestamp: i64) -> ScoreOutcome {
        let points = self.config.points_per_award;
        self.state.consecutive_good_count = 0;
        self.state.points += u64::from(points);
        self.state.streak.current += 1;
        self.state.streak.longest = self.state.streak.longest.max(self.state.streak.current);

        let (date, time) = self.local_date_time(timestamp);
        self.state.history.push(HistoryEntry {
            date: date.clone(),
            time: time.clone(),
            points,
            kind: HistoryKind::GoodPosture,
            achievement: None,
        });

        let mut unlocked = Vec::new();
        for achievement in Achievement::ALL {
            if !self.state.achievements.contains(&achievement)
                && achievement.is_earned(self.state.points, &self.state.streak)
            {
                self.state.achievements.insert(achievement);
                self.state.history.push(HistoryEntry {
                    date: date.clone(),
                    time: time.clone(),
                    points: 0,
                    kind: HistoryKind::Achievement,
                    achievement: Some(achievement),
                });
                unlocked.push(achievement);
            }
        }

        info!(
            points = self.state.points,
            streak = self.state.streak.current,
            longest = self.state.streak.longest,
            ?unlocked,
            "posture point awarded"
        );

        let persisted = self.flush().is_ok();
        ScoreOutcome::Awarded {
            points: self.state.points,
            persisted,
            achievements: unlocked,
        }
    }

    fn local_date_time(&self, timestamp: i64) -> (String, String) {
        let at = DateTime::<Utc>::from_timestamp(timestamp, 0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .with_timezone(&self.utc_offset);
        (
            at.format("%Y-%m-%d").to_string(),
            at.format("%H:%M:%S").to_string(),
        )
    }

    fn notify(&mut self) {
        for listener in self.listeners.iter_mut() {
            listener(&self.state);
        }
    }
}

/// Restore invariants on state read from the store
fn repair(mut state: ScoreState, run_length: u32) -> ScoreState {
    if state.streak.current > state.streak.longest {
        state.streak.longest = state.streak.current;
    }
    if state.consecutive_good_count >= run_length {
        state.consecutive_good_count = 0;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::Streak;
    use chrono::Offset;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Mutex;

    const USER: &str = "user-1";
    const T0: i64 = 1_705_312_800; // 2024-01-15T10:00:00Z

    fn engine() -> (Arc<InMemoryStore>, ScoringEngine) {
        let store = Arc::new(InMemoryStore::new());
        let engine = ScoringEngine::new(
            USER,
            store.clone(),
            ScoringConfig::default(),
            Utc.fix(),
        );
        (store, engine)
    }

    fn event(timestamp: i64, class: PostureClass) -> ClassificationEvent {
        ClassificationEvent { timestamp, class }
    }

    /// Feed events one second apart with "now" tracking the stream
    fn feed(engine: &mut ScoringEngine, start: i64, classes: &[PostureClass]) -> Vec<ScoreOutcome> {
        classes
            .iter()
            .enumerate()
            .map(|(i, class)| {
                let ts = start + i as i64;
                engine.process(event(ts, *class), ts)
            })
            .collect()
    }

    #[test]
    fn test_thirty_good_awards_one_point() {
        let (store, mut engine) = engine();
        let outcomes = feed(&mut engine, T0, &[PostureClass::Good; 30]);

        assert_eq!(
            outcomes[28],
            ScoreOutcome::Counted {
                consecutive_good: 29
            }
        );
        assert!(matches!(
            outcomes[29],
            ScoreOutcome::Awarded {
                points: 1,
                persisted: true,
                ..
            }
        ));
        let state = engine.state();
        assert_eq!(state.points, 1);
        assert_eq!(state.consecutive_good_count, 0);
        assert_eq!(state.streak, Streak { current: 1, longest: 1 });
        assert_eq!(state.history[0].date, "2024-01-15");
        assert_eq!(state.history[0].time, "10:00:29");
        assert_eq!(state.history[0].kind, HistoryKind::GoodPosture);

        let persisted: ScoreState = serde_json::from_value(
            store
                .get(&StorePath::new(USER, Namespace::Score))
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(&persisted, engine.state());
    }

    #[test]
    fn test_bad_resets_run() {
        let (_store, mut engine) = engine();
        let mut classes = vec![PostureClass::Good; 29];
        classes.push(PostureClass::Bad);
        let outcomes = feed(&mut engine, T0, &classes);

        assert_eq!(outcomes[29], ScoreOutcome::Reset);
        assert_eq!(engine.state().points, 0);
        assert_eq!(engine.state().consecutive_good_count, 0);
    }

    #[test]
    fn test_warning_holds_run() {
        let (_store, mut engine) = engine();
        let mut classes = vec![PostureClass::Good; 20];
        classes.extend([PostureClass::Warning; 5]);
        classes.extend([PostureClass::Good; 10]);
        feed(&mut engine, T0, &classes);

        assert_eq!(engine.state().points, 1);
        assert_eq!(engine.state().consecutive_good_count, 0);
    }

    #[test]
    fn test_bad_does_not_reset_streak() {
        let (_store, mut engine) = engine();
        feed(&mut engine, T0, &[PostureClass::Good; 60]);
        feed(&mut engine, T0 + 60, &[PostureClass::Bad; 3]);
        assert_eq!(engine.state().streak, Streak { current: 2, longest: 2 });
    }

    #[test]
    fn test_out_of_order_ignored() {
        let (_store, mut engine) = engine();
        engine.process(event(T0 + 10, PostureClass::Good), T0 + 10);
        let before = engine.state().clone();

        assert_eq!(
            engine.process(event(T0 + 10, PostureClass::Bad), T0 + 11),
            ScoreOutcome::Ignored {
                reason: IgnoreReason::OutOfOrder
            }
        );
        assert_eq!(
            engine.process(event(T0 + 5, PostureClass::Bad), T0 + 11),
            ScoreOutcome::Ignored {
                reason: IgnoreReason::OutOfOrder
            }
        );
        assert_eq!(engine.state(), &before);
        assert_eq!(engine.last_processed(), Some(T0 + 10));
    }

    #[test]
    fn test_stale_ignored() {
        let (_store, mut engine) = engine();
        let now = T0 + 1_000;
        assert_eq!(
            engine.process(event(now - 181, PostureClass::Good), now),
            ScoreOutcome::Ignored {
                reason: IgnoreReason::Stale
            }
        );
        assert_eq!(engine.last_processed(), None);
        assert!(matches!(
            engine.process(event(now - 180, PostureClass::Good), now),
            ScoreOutcome::Counted { .. }
        ));
    }

    #[test]
    fn test_failed_persist_is_retried() {
        let (store, mut engine) = engine();
        feed(&mut engine, T0, &[PostureClass::Good; 29]);
        store.fail_next_writes(1);

        let outcome = engine.process(event(T0 + 29, PostureClass::Good), T0 + 29);
        assert!(matches!(
            outcome,
            ScoreOutcome::Awarded {
                persisted: false,
                ..
            }
        ));
        assert!(engine.has_unpersisted_changes());
        assert_eq!(engine.state().points, 1);
        let path = StorePath::new(USER, Namespace::Score);
        assert_eq!(store.get(&path).unwrap(), None);

        engine.process(event(T0 + 30, PostureClass::Warning), T0 + 30);
        assert!(!engine.has_unpersisted_changes());
        assert_eq!(store.get(&path).unwrap().unwrap()["points"], 1);
    }

    #[test]
    fn test_achievements_unlock_once() {
        let (_store, mut engine) = engine();
        let outcomes = feed(&mut engine, T0, &[PostureClass::Good; 30]);
        match &outcomes[29] {
            ScoreOutcome::Awarded { achievements, .. } => {
                assert_eq!(achievements, &vec![Achievement::FirstPoint])
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let outcomes = feed(&mut engine, T0 + 30, &[PostureClass::Good; 120]);
        let unlocked: Vec<Achievement> = outcomes
            .into_iter()
            .filter_map(|o| match o {
                ScoreOutcome::Awarded { achievements, .. } => Some(achievements),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(unlocked, vec![Achievement::StreakOfFive]);
        assert_eq!(engine.state().points, 5);
        let achievement_entries = engine
            .state()
            .history
            .iter()
            .filter(|h| h.kind == HistoryKind::Achievement)
            .count();
        assert_eq!(achievement_entries, 2);
    }

    #[test]
    fn test_listeners_notified() {
        let (_store, mut engine) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.on_score_update(move |state| {
            sink.lock().unwrap().push(state.consecutive_good_count);
        });
        feed(&mut engine, T0, &[PostureClass::Good, PostureClass::Good, PostureClass::Bad]);
        engine.process(event(T0, PostureClass::Good), T0 + 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_load_repairs_state() {
        let store = Arc::new(InMemoryStore::new());
        store
            .set(
                &StorePath::new(USER, Namespace::Score),
                serde_json::json!({
                    "points": 4,
                    "consecutive_good_count": 31,
                    "streak": {"current": 6, "longest": 2}
                }),
            )
            .unwrap();
        let engine =
            ScoringEngine::load(USER, store, ScoringConfig::default(), Utc.fix()).unwrap();
        assert_eq!(engine.state().points, 4);
        assert_eq!(engine.state().consecutive_good_count, 0);
        assert_eq!(engine.state().streak, Streak { current: 6, longest: 6 });
    }

    #[test]
    fn test_reset_current_streak_keeps_longest() {
        let (_store, mut engine) = engine();
        feed(&mut engine, T0, &[PostureClass::Good; 60]);
        engine.reset_current_streak().unwrap();
        assert_eq!(engine.state().streak, Streak { current: 0, longest: 2 });
    }

    #[test]
    fn test_history_uses_local_offset() {
        let store = Arc::new(InMemoryStore::new());
        let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        let mut engine = ScoringEngine::new(USER, store, ScoringConfig::default(), offset);
        feed(&mut engine, T0 - 10 * 3600, &[PostureClass::Good; 30]);
        // 2024-01-15T00:00:29Z is 19:00:29 the previous day at UTC-5
        assert_eq!(engine.state().history[0].date, "2024-01-14");
        assert_eq!(engine.state().history[0].time, "19:00:29");
    }

    proptest! {
        #[test]
        fn prop_streak_never_exceeds_longest(classes in proptest::collection::vec(0u8..3, 0..200)) {
            let (_store, mut engine) = engine();
            for (i, c) in classes.iter().enumerate() {
                let class = match c {
                    0 => PostureClass::Good,
                    1 => PostureClass::Warning,
                    _ => PostureClass::Bad,
                };
                let ts = T0 + i as i64;
                engine.process(event(ts, class), ts);
                let state = engine.state();
                prop_assert!(state.streak.current <= state.streak.longest);
                prop_assert!(state.consecutive_good_count < 30);
            }
        }
    }
}
