use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{history::MAX_CAPACITY, MonitorError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub backend: BackendConfig,
    pub history: HistoryConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| MonitorError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fft = self.audio.fft_size;
        if fft < 32 || !fft.is_power_of_two() {
            return Err(MonitorError::Config(format!(
                "audio.fft_size must be a power of two >= 32, got {fft}"
            )));
        }
        if self.audio.frame_interval_ms == 0 || self.session.clock_period_ms == 0 {
            return Err(MonitorError::Config(
                "tick periods must be greater than zero".to_string(),
            ));
        }
        if self.session.prediction_interval_ms == 0 {
            return Err(MonitorError::Config(
                "session.prediction_interval_ms must be greater than zero".to_string(),
            ));
        }
        let capacity = self.history.capacity;
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(MonitorError::Config(format!(
                "history.capacity must be between 1 and {MAX_CAPACITY}, got {capacity}"
            )));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Transform size of the analyser. Frames hold half this many bytes.
    pub fft_size: usize,
    /// Interval between metrics ticks, roughly one display refresh.
    pub frame_interval_ms: u64,
    /// Length of the audio window submitted for classification.
    pub capture_window_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            frame_interval_ms: 16,
            capture_window_ms: 3_000,
        }
    }
}

impl AudioConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn capture_window(&self) -> Duration {
        Duration::from_millis(self.capture_window_ms)
    }
}

/// Timing of the capture session and its prediction cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub clock_period_ms: u64,
    pub warmup_ms: u64,
    pub prediction_interval_ms: u64,
    /// Upper bound on a single classification call. `None` waits forever.
    pub classification_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock_period_ms: 100,
            warmup_ms: 3_000,
            prediction_interval_ms: 5_000,
            classification_timeout_ms: Some(30_000),
        }
    }
}

impl SessionConfig {
    pub fn clock_period(&self) -> Duration {
        Duration::from_millis(self.clock_period_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn prediction_interval(&self) -> Duration {
        Duration::from_millis(self.prediction_interval_ms)
    }

    pub fn classification_timeout(&self) -> Option<Duration> {
        self.classification_timeout_ms.map(Duration::from_millis)
    }
}

/// Location of the classification backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    /// Directory holding the persisted history. Defaults to the user's data
    /// directory; `null` keeps history in memory only.
    pub directory: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_CAPACITY,
            directory: Some(default_history_dir().display().to_string()),
        }
    }
}

/// `<data dir>/acoustic-monitor`, or `./.acoustic-monitor` when the platform
/// has no data directory.
pub fn default_history_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("acoustic-monitor"))
        .unwrap_or_else(|| PathBuf::from(".acoustic-monitor"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_live_monitor_timings() {
        let config = AppConfig::default();
        assert_eq!(config.audio.fft_size, 2048);
        assert_eq!(config.session.warmup(), Duration::from_secs(3));
        assert_eq!(config.session.prediction_interval(), Duration::from_secs(5));
        assert_eq!(config.session.clock_period(), Duration::from_millis(100));
        assert_eq!(config.history.capacity, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "session": { "warmup_ms": 1000 } }"#).unwrap();
        assert_eq!(config.session.warmup_ms, 1_000);
        assert_eq!(config.session.prediction_interval_ms, 5_000);
        assert_eq!(config.backend.base_url, "http://localhost:5000/api");
    }

    #[test]
    fn history_is_file_backed_by_default() {
        let config = HistoryConfig::default();
        let directory = config.directory.expect("default history directory");
        assert!(directory.ends_with("acoustic-monitor"));
    }

    #[test]
    fn explicit_null_directory_keeps_history_in_memory() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "history": { "directory": null } }"#).unwrap();
        assert!(config.history.directory.is_none());
        assert_eq!(config.history.capacity, 20);
    }

    #[test]
    fn rejects_history_capacity_above_twenty() {
        let mut config = AppConfig::default();
        config.history.capacity = 21;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("history.capacity"));

        config.history.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_transform() {
        let mut config = AppConfig::default();
        config.audio.fft_size = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fft_size"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        fs::write(&path, r#"{ "audio": { "fft_size": 1024 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.audio.fft_size, 1024);
    }
}
