//! Core library for the acoustic monitor.
//!
//! A capture session owns the microphone stream and drives three periodic
//! activities on a single-threaded scheduler: signal metrics for the meters,
//! the elapsed-time clock, and the prediction cycle that ships audio windows
//! to a classification backend. Results land in a bounded, persisted
//! history ledger.

pub mod audio;
pub mod classifier;
pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod prediction;
pub mod scheduler;
pub mod session;
pub mod timeline;

pub use audio::{AudioDevice, AudioSegment, CpalDevice, DeviceConstraints, SampleFrame, SampleStream};
pub use classifier::{RestClassifier, SimulatedClassifier};
pub use config::{AppConfig, AudioConfig, BackendConfig, HistoryConfig, SessionConfig};
pub use error::{ErrorKind, MonitorError, Result};
pub use history::{FileStore, HistoryEntry, HistoryLedger, HistoryStore, MemoryStore};
pub use metrics::{
    compute_dominant_frequency, compute_volume_db, display_volume_db, volume_percent,
    MetricsEngine, SignalMetrics,
};
pub use prediction::{ClassLabel, Classifier, PredictionCycle, PredictionResult};
pub use scheduler::{LocalScheduler, Scheduler, TaskHandle};
pub use session::{CaptureSession, CaptureSessionContext, SessionSnapshot, SessionStatus};
pub use timeline::{format_elapsed, RecordingClock};
