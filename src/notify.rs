//! Posture alert gate
//!
//! Debounces classification bursts and decides when a user-facing alert is
//! shown or cleared. Only the last classification inside the debounce window
//! is acted on; a shown alert clears itself after the auto-dismiss duration
//! unless it is re-triggered or dismissed first.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::NotificationConfig;
use crate::scheduler::{TimerId, TimerQueue};
use crate::types::PostureClass;

/// Currently visible alert
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub class: PostureClass,
    pub confidence: f64,
    pub shown_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    Shown { class: PostureClass, confidence: f64 },
    Cleared { class: PostureClass },
    AutoDismissed { class: PostureClass },
    Dismissed { class: PostureClass },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateTimer {
    Debounce,
    AutoDismiss,
}

#[derive(Debug, Clone)]
pub struct NotificationGate {
    config: NotificationConfig,
    pending: Option<(PostureClass, f64)>,
    visible: Option<Alert>,
    timers: TimerQueue<GateTimer>,
    debounce_timer: Option<TimerId>,
    dismiss_timer: Option<TimerId>,
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new(NotificationConfig::default())
    }
}

impl NotificationGate {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            pending: None,
            visible: None,
            timers: TimerQueue::new(),
            debounce_timer: None,
            dismiss_timer: None,
        }
    }

    pub fn visible(&self) -> Option<&Alert> {
        self.visible.as_ref()
    }

    /// Whether a classification should raise an alert
    pub fn should_alert(&self, class: PostureClass, confidence: f64) -> bool {
        match class {
            PostureClass::Bad => true,
            PostureClass::Warning => confidence > self.config.warning_confidence,
            PostureClass::Good => false,
        }
    }

    /// Buffer a classification; it is acted on once the stream is quiet
    pub fn submit(&mut self, class: PostureClass, confidence: f64, now_ms: u64) {
        self.pending = Some((class, confidence));
        if let Some(id) = self.debounce_timer.take() {
            self.timers.cancel(id);
        }
        self.debounce_timer = Some(
            self.timers
                .schedule(now_ms + self.config.debounce_ms, GateTimer::Debounce),
        );
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        for timer in self.timers.poll(now_ms) {
            match timer {
                GateTimer::Debounce => {
                    self.debounce_timer = None;
                    if let Some((class, confidence)) = self.pending.take() {
                        if let Some(event) = self.apply(class, confidence, now_ms) {
                            events.push(event);
                        }
                    }
                }
                GateTimer::AutoDismiss => {
                    self.dismiss_timer = None;
                    if let Some(alert) = self.visible.take() {
                        debug!(class = alert.class.as_str(), "alert auto-dismissed");
                        events.push(NotificationEvent::AutoDismissed { class: alert.class });
                    }
                }
            }
        }
        events
    }

    /// User dismissed the visible alert
    pub fn dismiss(&mut self) -> Option<NotificationEvent> {
        let alert = self.visible.take()?;
        if let Some(id) = self.dismiss_timer.take() {
            self.timers.cancel(id);
        }
        info!(class = alert.class.as_str(), "posture alert dismissed");
        Some(NotificationEvent::Dismissed { class: alert.class })
    }

    /// Drop pending input, the visible alert and all timers
    pub fn teardown(&mut self) {
        self.timers.cancel_all();
        self.pending = None;
        self.visible = None;
        self.debounce_timer = None;
        self.dismiss_timer = None;
    }

    fn apply(
        &mut self,
        class: PostureClass,
        confidence: f64,
        now_ms: u64,
    ) -> Option<NotificationEvent> {
        if let Some(id) = self.dismiss_timer.take() {
            self.timers.cancel(id);
        }

        if self.should_alert(class, confidence) {
            self.visible = Some(Alert {
                class,
                confidence,
                shown_at_ms: now_ms,
            });
            self.dismiss_timer = Some(
                self.timers
                    .schedule(now_ms + self.config.auto_dismiss_ms, GateTimer::AutoDismiss),
            );
            info!(class = class.as_str(), confidence, "posture alert shown");
            return Some(NotificationEvent::Shown { class, confidence });
        }

        let cleared = self.visible.take()?;
        debug!(class = cleared.class.as_str(), "posture alert cleared");
        Some(NotificationEvent::Cleared {
            class: cleared.class,
        })
    }
}
