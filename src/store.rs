//! External key-value store interface
//!
//! The persistent store is a push/subscribe key-value service owned by the
//! application shell. Engines only ever `get`, `set`, `push` and `subscribe`;
//! they never rely on reading back their own writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use crate::error::PostureError;

/// Per-user data namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Samples,
    ModelTree,
    ModelThresholds,
    CalibrationCommand,
    CalibrationFlag,
    CompletedSteps,
    Score,
    DailyHistory,
    Logs,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Samples => "samples",
            Namespace::ModelTree => "model/tree",
            Namespace::ModelThresholds => "model/thresholds",
            Namespace::CalibrationCommand => "calibration/command",
            Namespace::CalibrationFlag => "calibration/calibrated",
            Namespace::CompletedSteps => "calibration/completed_steps",
            Namespace::Score => "score",
            Namespace::DailyHistory => "history/daily",
            Namespace::Logs => "logs",
        }
    }
}

/// Fully qualified store key, `users/{user_id}/{namespace}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    pub user_id: String,
    pub namespace: Namespace,
}

impl StorePath {
    pub fn new(user_id: impl Into<String>, namespace: Namespace) -> Self {
        Self {
            user_id: user_id.into(),
            namespace,
        }
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "users/{}/{}", self.user_id, self.namespace.as_str())
    }
}

/// Notification delivered to subscribers after a successful write
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub path: StorePath,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Timestamped entry in the per-user device log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
}

impl DeviceLogEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            severity,
        }
    }
}

/// Get/set/subscribe access to the external store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, path: &StorePath) -> Result<Option<Value>, PostureError>;

    fn set(&self, path: &StorePath, value: Value) -> Result<(), PostureError>;

    /// Append to a list-valued key, creating it if absent
    fn push(&self, path: &StorePath, value: Value) -> Result<(), PostureError>;

    /// Receive every subsequent change to `path`
    fn subscribe(&self, path: &StorePath) -> Receiver<StoreChange>;
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Value>,
    subscribers: HashMap<String, Vec<Sender<StoreChange>>>,
    failing_writes: u32,
    failing_paths: HashSet<String>,
}

/// In-process store used by tests, the CLI and FFI sessions
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_writes = count;
        }
    }

    /// Make every write to `path` fail until `restore_writes` is called
    pub fn fail_writes_to(&self, path: &StorePath) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_paths.insert(path.to_string());
        }
    }

    /// Clear all injected write failures
    pub fn restore_writes(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing_writes = 0;
            inner.failing_paths.clear();
        }
    }

    fn write<F>(&self, path: &StorePath, update: F) -> Result<(), PostureError>
    where
        F: FnOnce(Option<&mut Value>) -> Value,
    {
        let key = path.to_string();
        let mut inner = self.inner.lock().map_err(|e| PostureError::StoreWrite {
            path: key.clone(),
            reason: e.to_string(),
        })?;

        if inner.failing_paths.contains(&key) {
            return Err(PostureError::StoreWrite {
                path: key,
                reason: "injected write failure".to_string(),
            });
        }
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(PostureError::StoreWrite {
                path: key,
                reason: "injected write failure".to_string(),
            });
        }

        let value = update(inner.values.get_mut(&key));
        inner.values.insert(key.clone(), value.clone());

        if let Some(senders) = inner.subscribers.get_mut(&key) {
            senders.retain(|tx| {
                tx.send(StoreChange {
                    path: path.clone(),
                    value: value.clone(),
                })
                .is_ok()
            });
        }
        Ok(())
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, path: &StorePath) -> Result<Option<Value>, PostureError> {
        let key = path.to_string();
        let inner = self.inner.lock().map_err(|e| PostureError::StoreRead {
            path: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(inner.values.get(&key).cloned())
    }

    fn set(&self, path: &StorePath, value: Value) -> Result<(), PostureError> {
        self.write(path, |_| value)
    }

    fn push(&self, path: &StorePath, value: Value) -> Result<(), PostureError> {
        self.write(path, |existing| match existing {
            Some(Value::Array(items)) => {
                let mut items = std::mem::take(items);
                items.push(value);
                Value::Array(items)
            }
            _ => Value::Array(vec![value]),
        })
    }

    fn subscribe(&self, path: &StorePath) -> Receiver<StoreChange> {
        let (tx, rx) = channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .subscribers
                .entry(path.to_string())
                .or_default()
                .push(tx);
        }
        rx
    }
}
