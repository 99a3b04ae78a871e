//! Posture Flux - On-device posture sensing engine
//!
//! Posture Flux turns a stream of wearable orientation samples into posture
//! classes, drives the sensor calibration procedure and converts sustained
//! good posture into points, streaks and achievements:
//! raw sample → feature extraction → decision evaluation → scoring / alerts /
//! aggregation.
//!
//! ## Modules
//!
//! - **Classification**: Trailing-window features and decision tree or
//!   threshold evaluation
//! - **Calibration**: Three timed collection steps plus the model-build wait
//! - **Scoring**: Hysteresis point awards, streaks, history and achievements
//! - **Aggregation**: Time-of-day buckets and the rolling weekly split
//!
//! Time is always injected by the caller (`now_ms`), timers fire from
//! `tick()`, and persistence goes through the [`store::KeyValueStore`] trait.

pub mod aggregate;
pub mod calibration;
pub mod config;
pub mod decision;
pub mod error;
pub mod features;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod schema;
pub mod scoring;
pub mod store;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use calibration::{CalibrationEvent, CalibrationState, CalibrationStateMachine};
pub use config::PostureConfig;
pub use decision::{DecisionNode, DecisionTree, PostureProfile};
pub use error::PostureError;
pub use pipeline::{classify_samples, PostureSession, SessionEvent};
pub use scoring::{ScoreOutcome, ScoringEngine};
pub use store::{InMemoryStore, KeyValueStore};

// Schema exports
pub use schema::{SampleAdapter, SampleRecord, SCHEMA_VERSION};

/// Library version reported by the CLI and FFI
pub const POSTURE_FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for reports
pub const PRODUCER_NAME: &str = "posture-flux";
