//! Capture session state machine.
//!
//! `Idle → Starting → Active → Stopping → Idle`, with `Errored` reachable
//! from `Starting` and `Active`. A [`CaptureSession`] owns the device stream,
//! the recording clock and the handles of every scheduled task while active;
//! all of them are released together by one teardown routine on every exit
//! path. Observers read state through a [`CaptureSessionContext`].

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    sync::{Arc, Mutex, MutexGuard, Weak as ArcWeak},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    audio::{AudioDevice, DeviceConstraints, SampleStream},
    history::{HistoryEntry, HistoryLedger},
    metrics::{MetricsEngine, SignalMetrics},
    prediction::{Classifier, PredictionCycle, PredictionResult, SegmentSource},
    scheduler::{Scheduler, TaskHandle},
    timeline::{format_elapsed, RecordingClock},
    AudioConfig, ErrorKind, MonitorError, Result, SessionConfig,
};

/// Lifecycle state of the capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum SessionStatus {
    Idle,
    Starting,
    Active,
    Stopping,
    Errored(ErrorKind),
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Read-only view of the session for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub status_text: String,
    pub volume_db: f32,
    pub dominant_freq_hz: f32,
    pub elapsed: Duration,
    pub processing: bool,
    pub epoch: u64,
}

impl SessionSnapshot {
    /// Elapsed recording time as `mm:ss`.
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed)
    }
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    status_text: String,
    started_at: Option<Instant>,
    metrics: SignalMetrics,
    elapsed: Duration,
    processing: bool,
    epoch: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            status_text: "Ready".to_string(),
            started_at: None,
            metrics: SignalMetrics::default(),
            elapsed: Duration::ZERO,
            processing: false,
            epoch: 0,
        }
    }
}

impl SessionState {
    /// Back to defaults, keeping the epoch counter.
    fn reset(&mut self, status: SessionStatus, status_text: String) {
        let epoch = self.epoch;
        *self = Self {
            status,
            status_text,
            epoch,
            ..Self::default()
        };
    }
}

struct ContextShared {
    state: Mutex<SessionState>,
    prediction: Mutex<Option<PredictionResult>>,
    history: Mutex<HistoryLedger>,
}

/// Shared state of the monitor: session fields, the current prediction and
/// the history ledger. Cheap to clone; every component receives one.
#[derive(Clone)]
pub struct CaptureSessionContext {
    shared: Arc<ContextShared>,
}

/// Non-owning reference to a [`CaptureSessionContext`].
#[derive(Clone)]
pub struct WeakContext {
    shared: ArcWeak<ContextShared>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<CaptureSessionContext> {
        self.shared
            .upgrade()
            .map(|shared| CaptureSessionContext { shared })
    }
}

impl CaptureSessionContext {
    pub fn new(history: HistoryLedger) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                state: Mutex::new(SessionState::default()),
                prediction: Mutex::new(None),
                history: Mutex::new(history),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            status: state.status,
            status_text: state.status_text.clone(),
            volume_db: state.metrics.volume_db,
            dominant_freq_hz: state.metrics.dominant_freq_hz,
            elapsed: state.elapsed,
            processing: state.processing,
            epoch: state.epoch,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.state().started_at
    }

    pub fn current_prediction(&self) -> Option<PredictionResult> {
        self.prediction().clone()
    }

    /// History entries, newest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.ledger().entries()
    }

    /// Reloads history from storage. Corrupt or missing data loads as empty.
    pub fn load_history(&self) -> Vec<HistoryEntry> {
        self.ledger().load()
    }

    pub fn clear_history(&self) -> Result<()> {
        self.ledger().clear()
    }

    /// True while the session is active and still on `epoch`.
    pub fn is_active_epoch(&self, epoch: u64) -> bool {
        let state = self.state();
        state.status.is_active() && state.epoch == epoch
    }

    /// Replaces the current prediction and records it in the history, if
    /// the session that requested it is still the active one.
    pub(crate) fn apply_prediction(&self, epoch: u64, result: PredictionResult) -> bool {
        if !self.is_active_epoch(epoch) {
            return false;
        }

        let entry = HistoryEntry::from(&result);
        tracing::info!(
            class = %result.class_label(),
            confidence = result.confidence(),
            "prediction received"
        );
        *self.prediction() = Some(result);
        if let Err(err) = self.ledger().append(entry) {
            tracing::warn!(error = %err, "history kept in memory only");
        }
        true
    }

    pub(crate) fn set_processing(&self, epoch: u64, processing: bool) {
        let mut state = self.state();
        if state.epoch == epoch && state.status.is_active() {
            state.processing = processing;
        }
    }

    fn begin_starting(&self) {
        let mut state = self.state();
        state.reset(SessionStatus::Starting, "Initializing...".to_string());
    }

    /// Enters `Active` and returns the new session epoch.
    fn activate(&self, at: Instant) -> u64 {
        let mut state = self.state();
        state.epoch += 1;
        state.status = SessionStatus::Active;
        state.status_text = "Recording...".to_string();
        state.started_at = Some(at);
        state.epoch
    }

    fn record_metrics(&self, metrics: SignalMetrics) {
        let mut state = self.state();
        if state.status.is_active() {
            state.metrics = metrics;
        }
    }

    fn record_elapsed(&self, elapsed: Duration) {
        let mut state = self.state();
        if state.status.is_active() {
            state.elapsed = elapsed;
        }
    }

    fn mark_stopping(&self) {
        self.state().status = SessionStatus::Stopping;
    }

    fn finish_stopped(&self) {
        self.state()
            .reset(SessionStatus::Idle, "Stopped".to_string());
    }

    fn fail(&self, err: &MonitorError) {
        self.state()
            .reset(SessionStatus::Errored(err.kind()), format!("Error: {err}"));
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prediction(&self) -> MutexGuard<'_, Option<PredictionResult>> {
        self.shared
            .prediction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ledger(&self) -> MutexGuard<'_, HistoryLedger> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CaptureSessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSessionContext")
            .field("status", &self.status())
            .finish()
    }
}

/// Everything held while a capture is running.
struct ActiveResources {
    stream: Box<dyn SampleStream>,
    clock: RecordingClock,
    metrics: MetricsEngine,
    metrics_task: Option<TaskHandle>,
    clock_task: Option<TaskHandle>,
    prediction_task: Option<TaskHandle>,
}

type SharedResources = Rc<RefCell<Option<ActiveResources>>>;

/// Releases the stream, cancels every task and stops the clock, in that
/// order. Each step runs even if an earlier one failed.
fn teardown(mut resources: ActiveResources) {
    if let Err(err) = resources.stream.release() {
        tracing::warn!(error = %err, "audio input release failed during teardown");
    }
    if let Some(mut task) = resources.metrics_task.take() {
        task.cancel();
    }
    if let Some(mut task) = resources.clock_task.take() {
        task.cancel();
    }
    resources.clock.stop();
    if let Some(mut task) = resources.prediction_task.take() {
        task.cancel();
    }
}

/// The capture session. Accepts exactly two commands: [`start`] and
/// [`stop`].
///
/// [`start`]: CaptureSession::start
/// [`stop`]: CaptureSession::stop
pub struct CaptureSession {
    device: Box<dyn AudioDevice>,
    scheduler: Rc<dyn Scheduler>,
    classifier: Rc<dyn Classifier>,
    audio: AudioConfig,
    timing: SessionConfig,
    context: CaptureSessionContext,
    resources: SharedResources,
}

impl CaptureSession {
    pub fn new(
        device: Box<dyn AudioDevice>,
        scheduler: Rc<dyn Scheduler>,
        classifier: Rc<dyn Classifier>,
        context: CaptureSessionContext,
    ) -> Self {
        Self {
            device,
            scheduler,
            classifier,
            audio: AudioConfig::default(),
            timing: SessionConfig::default(),
            context,
            resources: Rc::new(RefCell::new(None)),
        }
    }

    pub fn with_audio_config(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_session_config(mut self, timing: SessionConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn context(&self) -> &CaptureSessionContext {
        &self.context
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.context.snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        self.context.status()
    }

    /// Acquires the input and starts the metrics tick, the recording clock
    /// and, after the warm-up, the prediction cycle.
    ///
    /// Device failures leave the session `Errored` with nothing held and are
    /// returned to the caller.
    pub fn start(&mut self) -> Result<()> {
        match self.context.status() {
            SessionStatus::Idle | SessionStatus::Errored(_) => {}
            SessionStatus::Starting | SessionStatus::Active | SessionStatus::Stopping => {
                return Err(MonitorError::AlreadyActive);
            }
        }

        self.context.begin_starting();
        tracing::info!("starting capture session");

        let constraints = DeviceConstraints::from_config(&self.audio);
        let mut stream = match self.device.acquire(&constraints) {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail_start(err)),
        };
        if let Err(err) = stream.start() {
            if let Err(release_err) = stream.release() {
                tracing::warn!(error = %release_err, "release after failed start also failed");
            }
            return Err(self.fail_start(err));
        }

        let now = self.scheduler.now();
        let epoch = self.context.activate(now);
        let mut clock = RecordingClock::new();
        clock.start(now);

        *self.resources.borrow_mut() = Some(ActiveResources {
            stream,
            clock,
            metrics: MetricsEngine::new(),
            metrics_task: None,
            clock_task: None,
            prediction_task: None,
        });

        let metrics_task = self.scheduler.schedule_repeating(
            "metrics",
            self.audio.frame_interval(),
            self.metrics_tick(),
        );
        let clock_task = self.scheduler.schedule_repeating(
            "recording-clock",
            self.timing.clock_period(),
            self.clock_tick(),
        );
        let cycle = PredictionCycle::new(
            self.context.downgrade(),
            epoch,
            self.classifier.clone(),
            self.scheduler.clone(),
            self.segment_source(),
        )
        .with_interval(self.timing.prediction_interval())
        .with_timeout(self.timing.classification_timeout());
        let prediction_task =
            self.scheduler
                .schedule_after("prediction-cycle", self.timing.warmup(), cycle.begin());

        if let Some(resources) = self.resources.borrow_mut().as_mut() {
            resources.metrics_task = Some(metrics_task);
            resources.clock_task = Some(clock_task);
            resources.prediction_task = Some(prediction_task);
        }

        tracing::info!(epoch, "capture session active");
        Ok(())
    }

    /// Tears the session down. A no-op when already idle.
    pub fn stop(&mut self) {
        let status = self.context.status();
        if status == SessionStatus::Idle {
            tracing::debug!("stop ignored, no capture session");
            return;
        }

        self.context.mark_stopping();
        let resources = self.resources.borrow_mut().take();
        if let Some(resources) = resources {
            teardown(resources);
        }
        self.context.finish_stopped();
        tracing::info!(?status, "capture session stopped");
    }

    fn fail_start(&self, err: MonitorError) -> MonitorError {
        tracing::error!(error = %err, "capture session failed to start");
        self.context.fail(&err);
        err
    }

    fn metrics_tick(&self) -> Box<dyn FnMut()> {
        let resources = Rc::downgrade(&self.resources);
        let context = self.context.clone();
        Box::new(move || {
            let Some(resources) = resources.upgrade() else {
                return;
            };

            let outcome = {
                let mut slot = resources.borrow_mut();
                let Some(active) = slot.as_mut() else {
                    return;
                };
                match active.stream.take_error() {
                    Some(err) => Err(err),
                    None => Ok(active.metrics.tick(active.stream.as_mut())),
                }
            };

            match outcome {
                Ok(metrics) => context.record_metrics(metrics),
                Err(err) => {
                    tracing::error!(error = %err, "audio input failed mid-session");
                    let taken = resources.borrow_mut().take();
                    if let Some(active) = taken {
                        teardown(active);
                    }
                    context.fail(&err);
                }
            }
        })
    }

    fn clock_tick(&self) -> Box<dyn FnMut()> {
        let resources: Weak<_> = Rc::downgrade(&self.resources);
        let scheduler = self.scheduler.clone();
        let context = self.context.clone();
        Box::new(move || {
            let Some(resources) = resources.upgrade() else {
                return;
            };
            let now = scheduler.now();
            let elapsed = resources
                .borrow()
                .as_ref()
                .map(|active| active.clock.elapsed_since(now));
            if let Some(elapsed) = elapsed {
                context.record_elapsed(elapsed);
            }
        })
    }

    fn segment_source(&self) -> SegmentSource {
        let resources = Rc::downgrade(&self.resources);
        let window = self.audio.capture_window();
        Box::new(move || {
            let resources = resources.upgrade()?;
            let segment = resources
                .borrow_mut()
                .as_mut()
                .map(|active| active.stream.capture_segment(window));
            segment
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let taken = self.resources.borrow_mut().take();
        if let Some(resources) = taken {
            teardown(resources);
        }
        if self.context.status() != SessionStatus::Idle {
            self.context.finish_stopped();
        }
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("status", &self.context.status())
            .field("classifier", &self.classifier.name())
            .finish()
    }
}
