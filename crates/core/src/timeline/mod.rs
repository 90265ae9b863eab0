use std::time::Duration;

use tokio::time::Instant;

/// Wall-clock timer for the active capture.
///
/// Elapsed time is always derived from the start timestamp rather than
/// accumulated per tick, so a late or skipped tick never drifts the display.
#[derive(Debug, Default, Clone)]
pub struct RecordingClock {
    started_at: Option<Instant>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, at: Instant) {
        self.started_at = Some(at);
    }

    pub fn stop(&mut self) {
        self.started_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Time since `start`, or zero when stopped.
    pub fn elapsed_since(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or(Duration::ZERO)
    }
}

/// Renders a duration as `mm:ss`. Minutes keep counting past 59.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
