//! Calibration state machine
//!
//! Calibration collects three postures (upright, slight slouch, severe
//! slouch) for a fixed dwell time each, then waits for the device to report
//! that it has built a personalized model.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Step1 -> Step2 -> Step3 -> Processing -> Complete
//!   ^__________________ cancel / teardown ___________|
//! ```
//!
//! Each step advances only when its countdown reaches zero while the step is
//! still active. `Processing -> Complete` is driven solely by the external
//! `calibrated` flag; there is no local timeout. Time is injected through
//! `now_ms` and timers fire from `tick()`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::error::PostureError;
use crate::scheduler::TimerQueue;
use crate::store::{DeviceLogEntry, KeyValueStore, Namespace, Severity, StorePath};

/// Device command meaning "no step in progress"
pub const CLEAR_COMMAND: u8 = 0;

/// One of the three data-collection postures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStep {
    Upright,
    SlightSlouch,
    SevereSlouch,
}

impl CalibrationStep {
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(CalibrationStep::Upright),
            2 => Some(CalibrationStep::SlightSlouch),
            3 => Some(CalibrationStep::SevereSlouch),
            _ => None,
        }
    }

    /// Command value sent to the device for this step
    pub fn number(&self) -> u8 {
        match self {
            CalibrationStep::Upright => 1,
            CalibrationStep::SlightSlouch => 2,
            CalibrationStep::SevereSlouch => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CalibrationStep::Upright => "Upright",
            CalibrationStep::SlightSlouch => "Slight Slouch",
            CalibrationStep::SevereSlouch => "Severe Slouch",
        }
    }

    /// Step that must be completed before this one may start
    fn prerequisite(&self) -> Option<CalibrationStep> {
        match self {
            CalibrationStep::Upright => None,
            CalibrationStep::SlightSlouch => Some(CalibrationStep::Upright),
            CalibrationStep::SevereSlouch => Some(CalibrationStep::SlightSlouch),
        }
    }

    /// State entered once this step's countdown has elapsed
    fn state_after(&self) -> CalibrationState {
        match self {
            CalibrationStep::Upright => CalibrationState::Step2,
            CalibrationStep::SlightSlouch => CalibrationState::Step3,
            CalibrationStep::SevereSlouch => CalibrationState::Processing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    Idle,
    Step1,
    Step2,
    Step3,
    /// Waiting for the device to report `calibrated = true`
    Processing,
    Complete,
}

impl CalibrationState {
    fn for_step(step: CalibrationStep) -> Self {
        match step {
            CalibrationStep::Upright => CalibrationState::Step1,
            CalibrationStep::SlightSlouch => CalibrationState::Step2,
            CalibrationStep::SevereSlouch => CalibrationState::Step3,
        }
    }

    /// Numeric progress value used by existing dashboards (0, 1, 2, 3, 3.5, 4)
    pub fn progress_value(&self) -> f32 {
        match self {
            CalibrationState::Idle => 0.0,
            CalibrationState::Step1 => 1.0,
            CalibrationState::Step2 => 2.0,
            CalibrationState::Step3 => 3.0,
            CalibrationState::Processing => 3.5,
            CalibrationState::Complete => 4.0,
        }
    }
}

/// Observable transition produced by a command or by `tick()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CalibrationEvent {
    Recalibrating,
    StepStarted { step: CalibrationStep },
    StepCompleted { step: CalibrationStep },
    ProcessingStarted,
    Completed,
    Cancelled,
    CommandCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalibrationTimer {
    StepElapsed(CalibrationStep),
    DebounceRelease(CalibrationStep),
}

/// Snapshot of the session for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSession {
    pub state: CalibrationState,
    pub step: f32,
    pub completed_steps: Vec<u8>,
    pub countdown_seconds: u64,
    pub locked: bool,
    pub calibrated: bool,
    /// How long the session has been waiting in `Processing`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct CalibrationStateMachine {
    user_id: String,
    store: Arc<dyn KeyValueStore>,
    config: CalibrationConfig,
    state: CalibrationState,
    completed_steps: BTreeSet<CalibrationStep>,
    /// Step whose countdown is running
    active_step: Option<CalibrationStep>,
    /// Step that was triggered inside the debounce window
    debounce_lock: Option<CalibrationStep>,
    /// Last known value of the external `calibrated` flag
    calibrated: bool,
    processing_since_ms: Option<u64>,
    /// A clear command still has to reach the device
    pending_clear: bool,
    last_error: Option<String>,
    timers: TimerQueue<CalibrationTimer>,
}

impl CalibrationStateMachine {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            config,
            state: CalibrationState::Idle,
            completed_steps: BTreeSet::new(),
            active_step: None,
            debounce_lock: None,
            calibrated: false,
            processing_since_ms: None,
            pending_clear: false,
            last_error: None,
            timers: TimerQueue::new(),
        }
    }

    /// Restore the last known flag and completed steps from the store
    pub fn load(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: CalibrationConfig,
    ) -> Result<Self, PostureError> {
        let mut machine = Self::new(user_id, store, config);

        let flag = machine.store.get(&machine.path(Namespace::CalibrationFlag))?;
        machine.calibrated = flag.as_ref().and_then(Value::as_bool).unwrap_or(false);

        if let Some(Value::Array(steps)) =
            machine.store.get(&machine.path(Namespace::CompletedSteps))?
        {
            machine.completed_steps = steps
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|n| u8::try_from(n).ok())
                .filter_map(CalibrationStep::from_number)
                .collect();
        }

        if machine.calibrated {
            machine.state = CalibrationState::Complete;
        }
        Ok(machine)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn completed_steps(&self) -> Vec<u8> {
        self.completed_steps.iter().map(|s| s.number()).collect()
    }

    pub fn active_step(&self) -> Option<CalibrationStep> {
        self.active_step
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn is_locked(&self) -> bool {
        self.debounce_lock.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whole seconds left on the active countdown, rounded up
    pub fn countdown_seconds(&self, now_ms: u64) -> u64 {
        let Some(step) = self.active_step else {
            return 0;
        };
        self.timers
            .deadline_where(|t| *t == CalibrationTimer::StepElapsed(step))
            .map(|deadline| deadline.saturating_sub(now_ms).div_ceil(1000))
            .unwrap_or(0)
    }

    /// Time spent waiting for the device in `Processing`
    pub fn waiting_since(&self, now_ms: u64) -> Option<u64> {
        self.processing_since_ms
            .map(|since| now_ms.saturating_sub(since))
    }

    pub fn snapshot(&self, now_ms: u64) -> CalibrationSession {
        CalibrationSession {
            state: self.state,
            step: self.state.progress_value(),
            completed_steps: self.completed_steps(),
            countdown_seconds: self.countdown_seconds(now_ms),
            locked: self.is_locked(),
            calibrated: self.calibrated,
            waiting_ms: self.waiting_since(now_ms),
            last_error: self.last_error.clone(),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Start the countdown for step `number` (1..=3)
    ///
    /// Rejected while another countdown runs, when the same step is
    /// re-triggered inside the debounce window, or when the previous step
    /// has not been completed. Step 1 may always start; while calibrated it
    /// begins a recalibration. A failed command write rolls the step back so
    /// the caller can retry; after a recalibration the machine is left in
    /// `Idle`, since the previous calibration is already cleared.
    pub fn start_step(
        &mut self,
        number: u8,
        now_ms: u64,
    ) -> Result<Vec<CalibrationEvent>, PostureError> {
        let step = CalibrationStep::from_number(number).ok_or(PostureError::InvalidStep(number))?;

        if self.debounce_lock == Some(step) {
            debug!(step = number, "calibration trigger debounced");
            return Err(PostureError::Debounced(number));
        }
        if let Some(active) = self.active_step {
            return Err(PostureError::StepInProgress {
                active: active.number(),
            });
        }
        if let Some(required) = step.prerequisite() {
            if !self.completed_steps.contains(&required) {
                return Err(PostureError::StepOutOfOrder {
                    step: number,
                    missing: required.number(),
                });
            }
        }

        let mut events = Vec::new();
        let mut previous_state = self.state;

        if step == CalibrationStep::Upright && self.calibrated {
            self.store
                .set(&self.path(Namespace::CalibrationFlag), json!(false))
                .inspect_err(|e| self.last_error = Some(e.to_string()))?;
            self.calibrated = false;
            self.completed_steps.clear();
            self.persist_completed_steps();
            self.log(Severity::Info, "Recalibration started, previous calibration cleared");
            events.push(CalibrationEvent::Recalibrating);
            previous_state = CalibrationState::Idle;
        }

        let previous_waiting = self.processing_since_ms;
        self.active_step = Some(step);
        self.debounce_lock = Some(step);
        self.state = CalibrationState::for_step(step);
        self.processing_since_ms = None;
        let elapsed_timer = self.timers.schedule(
            now_ms + self.config.step_duration_secs * 1000,
            CalibrationTimer::StepElapsed(step),
        );
        let debounce_timer = self.timers.schedule(
            now_ms + self.config.debounce_ms,
            CalibrationTimer::DebounceRelease(step),
        );

        if let Err(e) = self.send_command(step.number()) {
            self.timers.cancel(elapsed_timer);
            self.timers.cancel(debounce_timer);
            self.active_step = None;
            self.debounce_lock = None;
            self.state = previous_state;
            self.processing_since_ms = previous_waiting;
            self.last_error = Some(e.to_string());
            warn!(step = number, error = %e, "calibration command failed, step rolled back");
            return Err(e);
        }

        self.last_error = None;
        info!(
            step = number,
            label = step.label(),
            duration_secs = self.config.step_duration_secs,
            "calibration step started"
        );
        self.log(
            Severity::Info,
            format!("Calibration step {} ({}) started", number, step.label()),
        );
        events.push(CalibrationEvent::StepStarted { step });
        Ok(events)
    }

    /// Advance timers; completes steps whose countdown has elapsed
    pub fn tick(&mut self, now_ms: u64) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();

        if self.pending_clear && self.try_clear_command() {
            events.push(CalibrationEvent::CommandCleared);
        }

        for timer in self.timers.poll(now_ms) {
            match timer {
                CalibrationTimer::DebounceRelease(step) => {
                    if self.debounce_lock == Some(step) {
                        self.debounce_lock = None;
                    }
                }
                CalibrationTimer::StepElapsed(step) => {
                    if self.active_step == Some(step)
                        && self.state == CalibrationState::for_step(step)
                    {
                        self.complete_step(step, now_ms, &mut events);
                    }
                }
            }
        }
        events
    }

    /// React to a change of the external `calibrated` flag
    pub fn on_calibrated_changed(&mut self, calibrated: bool) -> Option<CalibrationEvent> {
        self.calibrated = calibrated;
        if calibrated && self.state == CalibrationState::Processing {
            self.state = CalibrationState::Complete;
            self.processing_since_ms = None;
            info!("device reported calibration complete");
            self.log(Severity::Info, "Calibration complete");
            return Some(CalibrationEvent::Completed);
        }
        None
    }

    /// Return to `Idle`, cancelling timers and clearing the device command
    ///
    /// Local state is reset even if the clear command fails; the clear is
    /// then retried on every `tick()` until it reaches the device.
    pub fn cancel(&mut self) -> Result<Vec<CalibrationEvent>, PostureError> {
        let cancelled_timers = self.timers.cancel_all();
        self.active_step = None;
        self.debounce_lock = None;
        self.processing_since_ms = None;
        self.state = CalibrationState::Idle;
        debug!(cancelled_timers, "calibration cancelled");
        self.log(Severity::Info, "Calibration cancelled");

        let mut events = vec![CalibrationEvent::Cancelled];
        match self.send_command(CLEAR_COMMAND) {
            Ok(()) => {
                self.pending_clear = false;
                events.push(CalibrationEvent::CommandCleared);
                Ok(events)
            }
            Err(e) => {
                self.pending_clear = true;
                self.last_error = Some(e.to_string());
                warn!(error = %e, "failed to clear calibration command, will retry");
                Err(e)
            }
        }
    }

    /// Cancel everything before the session is dropped
    pub fn teardown(&mut self) -> Result<(), PostureError> {
        self.cancel().map(|_| ())
    }

    // ── Internals ────────────────────────────────────────────────────

    fn complete_step(
        &mut self,
        step: CalibrationStep,
        now_ms: u64,
        events: &mut Vec<CalibrationEvent>,
    ) {
        self.active_step = None;
        self.completed_steps.insert(step);
        self.persist_completed_steps();
        info!(step = step.number(), "calibration step completed");
        self.log(
            Severity::Info,
            format!("Calibration step {} ({}) completed", step.number(), step.label()),
        );
        events.push(CalibrationEvent::StepCompleted { step });

        if self.send_command(CLEAR_COMMAND).is_err() {
            self.pending_clear = true;
        } else {
            events.push(CalibrationEvent::CommandCleared);
        }

        self.state = step.state_after();
        if self.state == CalibrationState::Processing {
            self.processing_since_ms = Some(now_ms);
            info!("waiting for device to build calibration model");
            events.push(CalibrationEvent::ProcessingStarted);
        }
    }

    fn try_clear_command(&mut self) -> bool {
        match self.send_command(CLEAR_COMMAND) {
            Ok(()) => {
                self.pending_clear = false;
                true
            }
            Err(_) => false,
        }
    }

    fn send_command(&mut self, command: u8) -> Result<(), PostureError> {
        let result = self
            .store
            .set(&self.path(Namespace::CalibrationCommand), json!(command));
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        debug!(command, ok = result.is_ok(), "calibration command sent");
        result
    }

    fn persist_completed_steps(&mut self) {
        let steps = json!(self.completed_steps());
        if let Err(e) = self.store.set(&self.path(Namespace::CompletedSteps), steps) {
            warn!(error = %e, "failed to persist completed calibration steps");
            self.last_error = Some(e.to_string());
        }
    }

    fn log(&self, severity: Severity, message: impl Into<String>) {
        let entry = DeviceLogEntry::new(severity, message);
        let value = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to encode device log entry");
                return;
            }
        };
        if let Err(e) = self.store.push(&self.path(Namespace::Logs), value) {
            warn!(error = %e, "failed to write device log entry");
        }
    }

    fn path(&self, namespace: Namespace) -> StorePath {
        StorePath::new(self.user_id.clone(), namespace)
    }
}

impl Drop for CalibrationStateMachine {
    fn drop(&mut self) {
        if self.active_step.is_some() || self.pending_clear {
            if let Err(e) = self.send_command(CLEAR_COMMAND) {
                warn!(error = %e, "calibration command left set on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;

    const USER: &str = "user-1";

    fn setup() -> (Arc<InMemoryStore>, CalibrationStateMachine) {
        let store = Arc::new(InMemoryStore::new());
        let machine =
            CalibrationStateMachine::new(USER, store.clone(), CalibrationConfig::default());
        (store, machine)
    }

    fn command(store: &InMemoryStore) -> Option<Value> {
        store
            .get(&StorePath::new(USER, Namespace::CalibrationCommand))
            .unwrap()
    }

    #[test]
    fn test_step_one_runs_to_step_two() {
        let (store, mut machine) = setup();

        let events = machine.start_step(1, 0).unwrap();
        assert_eq!(
            events,
            vec![CalibrationEvent::StepStarted {
                step: CalibrationStep::Upright
            }]
        );
        assert_eq!(machine.state(), CalibrationState::Step1);
        assert_eq!(command(&store), Some(json!(1)));
        assert_eq!(machine.countdown_seconds(0), 15);
        assert_eq!(machine.countdown_seconds(10_500), 5);

        assert!(machine.tick(14_999).is_empty());
        assert!(machine.completed_steps().is_empty());

        let events = machine.tick(15_000);
        assert!(events.contains(&CalibrationEvent::StepCompleted {
            step: CalibrationStep::Upright
        }));
        assert_eq!(machine.completed_steps(), vec![1]);
        assert_eq!(machine.state(), CalibrationState::Step2);
        assert_eq!(machine.active_step(), None);
        assert_eq!(command(&store), Some(json!(0)));
        assert_eq!(
            store
                .get(&StorePath::new(USER, Namespace::CompletedSteps))
                .unwrap(),
            Some(json!([1]))
        );
    }

    #[test]
    fn test_other_step_rejected_during_countdown() {
        let (_store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        machine.tick(2_000);

        let err = machine.start_step(2, 2_000).unwrap_err();
        assert!(matches!(err, PostureError::StepInProgress { active: 1 }));
        assert_eq!(machine.state(), CalibrationState::Step1);
    }

    #[test]
    fn test_same_step_debounced() {
        let (_store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        assert!(machine.is_locked());

        let err = machine.start_step(1, 500).unwrap_err();
        assert!(matches!(err, PostureError::Debounced(1)));

        machine.tick(1_000);
        assert!(!machine.is_locked());
        // Still counting down, so a later retrigger is rejected as in progress
        let err = machine.start_step(1, 1_200).unwrap_err();
        assert!(matches!(err, PostureError::StepInProgress { active: 1 }));
    }

    #[test]
    fn test_invalid_step() {
        let (_store, mut machine) = setup();
        assert!(matches!(
            machine.start_step(4, 0),
            Err(PostureError::InvalidStep(4))
        ));
        assert!(matches!(
            machine.start_step(0, 0),
            Err(PostureError::InvalidStep(0))
        ));
    }

    #[test]
    fn test_full_sequence_waits_for_device() {
        let (_store, mut machine) = setup();
        let mut now = 0;
        for step in 1..=3u8 {
            machine.start_step(step, now).unwrap();
            now += 15_000;
            machine.tick(now);
            now += 2_000;
        }
        assert_eq!(machine.completed_steps(), vec![1, 2, 3]);
        assert_eq!(machine.state(), CalibrationState::Processing);
        assert_eq!(machine.state().progress_value(), 3.5);

        // No timeout: an hour later we are still waiting
        machine.tick(now + 3_600_000);
        assert_eq!(machine.state(), CalibrationState::Processing);
        assert!(machine.waiting_since(now + 3_600_000).unwrap() >= 3_600_000);

        assert_eq!(
            machine.on_calibrated_changed(true),
            Some(CalibrationEvent::Completed)
        );
        assert_eq!(machine.state(), CalibrationState::Complete);
        assert!(machine.is_calibrated());
        assert_eq!(machine.waiting_since(now), None);
    }

    #[test]
    fn test_calibrated_flag_ignored_outside_processing() {
        let (_store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        assert_eq!(machine.on_calibrated_changed(true), None);
        assert_eq!(machine.state(), CalibrationState::Step1);

        // Early confirmation does not complete the step either
        machine.tick(5_000);
        assert!(machine.completed_steps().is_empty());
    }

    #[test]
    fn test_recalibration_resets() {
        let (store, mut machine) = setup();
        let flag = StorePath::new(USER, Namespace::CalibrationFlag);
        store.set(&flag, json!(true)).unwrap();
        store
            .set(&StorePath::new(USER, Namespace::CompletedSteps), json!([1, 2, 3]))
            .unwrap();
        drop(machine);
        machine = CalibrationStateMachine::load(USER, store.clone(), CalibrationConfig::default())
            .unwrap();
        assert_eq!(machine.state(), CalibrationState::Complete);
        assert_eq!(machine.completed_steps(), vec![1, 2, 3]);

        let events = machine.start_step(1, 0).unwrap();
        assert_eq!(events[0], CalibrationEvent::Recalibrating);
        assert!(machine.completed_steps().is_empty());
        assert!(!machine.is_calibrated());
        assert_eq!(store.get(&flag).unwrap(), Some(json!(false)));
        assert_eq!(machine.state(), CalibrationState::Step1);
    }

    #[test]
    fn test_steps_start_in_order() {
        let (_store, mut machine) = setup();
        assert!(matches!(
            machine.start_step(3, 0),
            Err(PostureError::StepOutOfOrder {
                step: 3,
                missing: 2
            })
        ));
        assert!(matches!(
            machine.start_step(2, 0),
            Err(PostureError::StepOutOfOrder {
                step: 2,
                missing: 1
            })
        ));
        assert_eq!(machine.state(), CalibrationState::Idle);

        machine.start_step(1, 0).unwrap();
        machine.tick(15_000);
        // Cancel keeps completed steps, so step 2 may still follow
        machine.cancel().unwrap();
        machine.start_step(2, 16_000).unwrap();
        assert_eq!(machine.state(), CalibrationState::Step2);
    }

    #[test]
    fn test_failed_recalibration_command_returns_to_idle() {
        let (store, mut machine) = setup();
        store
            .set(&StorePath::new(USER, Namespace::CalibrationFlag), json!(true))
            .unwrap();
        store
            .set(&StorePath::new(USER, Namespace::CompletedSteps), json!([1, 2, 3]))
            .unwrap();
        drop(machine);
        machine = CalibrationStateMachine::load(USER, store.clone(), CalibrationConfig::default())
            .unwrap();
        store.fail_writes_to(&StorePath::new(USER, Namespace::CalibrationCommand));

        let err = machine.start_step(1, 0).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(machine.state(), CalibrationState::Idle);
        assert!(!machine.is_calibrated());
        assert!(machine.completed_steps().is_empty());
        assert_eq!(machine.active_step(), None);

        store.restore_writes();
        let events = machine.start_step(1, 10).unwrap();
        assert_eq!(
            events,
            vec![CalibrationEvent::StepStarted {
                step: CalibrationStep::Upright
            }]
        );
        assert_eq!(machine.state(), CalibrationState::Step1);
    }

    #[test]
    fn test_command_failure_rolls_back() {
        let (store, mut machine) = setup();
        store.fail_next_writes(1);

        let err = machine.start_step(1, 0).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(machine.state(), CalibrationState::Idle);
        assert_eq!(machine.active_step(), None);
        assert!(!machine.is_locked());
        assert!(machine.last_error().is_some());

        // Immediate retry is allowed
        machine.start_step(1, 10).unwrap();
        assert_eq!(machine.state(), CalibrationState::Step1);
        assert_eq!(machine.last_error(), None);

        // The rolled-back countdown never fires
        machine.tick(15_005);
        assert_eq!(machine.state(), CalibrationState::Step1);
        machine.tick(15_010);
        assert_eq!(machine.state(), CalibrationState::Step2);
    }

    #[test]
    fn test_cancel_clears_command_and_timers() {
        let (store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        assert_eq!(command(&store), Some(json!(1)));

        let events = machine.cancel().unwrap();
        assert_eq!(
            events,
            vec![CalibrationEvent::Cancelled, CalibrationEvent::CommandCleared]
        );
        assert_eq!(machine.state(), CalibrationState::Idle);
        assert_eq!(command(&store), Some(json!(0)));

        assert!(machine.tick(60_000).is_empty());
        assert!(machine.completed_steps().is_empty());
    }

    #[test]
    fn test_failed_cancel_retries_on_tick() {
        let (store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        // One failure for the cancel clear, one for the device log entry
        store.fail_next_writes(2);

        assert!(machine.cancel().is_err());
        assert_eq!(machine.state(), CalibrationState::Idle);
        assert_eq!(command(&store), Some(json!(1)));

        let events = machine.tick(100);
        assert_eq!(events, vec![CalibrationEvent::CommandCleared]);
        assert_eq!(command(&store), Some(json!(0)));
    }

    #[test]
    fn test_drop_clears_outstanding_command() {
        let (store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        drop(machine);
        assert_eq!(command(&store), Some(json!(0)));
    }

    #[test]
    fn test_snapshot_and_logs() {
        let (store, mut machine) = setup();
        machine.start_step(1, 0).unwrap();
        let snapshot = machine.snapshot(4_000);
        assert_eq!(snapshot.state, CalibrationState::Step1);
        assert_eq!(snapshot.step, 1.0);
        assert_eq!(snapshot.countdown_seconds, 11);
        assert!(snapshot.locked);

        let logs = store.get(&StorePath::new(USER, Namespace::Logs)).unwrap();
        let logs = logs.and_then(|v| v.as_array().cloned()).unwrap_or_default();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["severity"], "info");
    }
}
