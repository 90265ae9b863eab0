/// Result alias that carries the custom [`MonitorError`] type.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Common error type for the core crate.
///
/// Device failures are fatal to a capture session. Classification and
/// persistence failures are isolated and never affect capture integrity.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The host refused access to the audio input.
    #[error("microphone access was denied; check input permissions")]
    PermissionDenied,
    /// No usable input device, or the device went away mid-session.
    #[error("audio input unavailable: {0}")]
    DeviceUnavailable(String),
    /// A single classification attempt failed or timed out.
    #[error("classification failed: {0}")]
    ClassificationFailed(String),
    /// History could not be written to or removed from storage.
    #[error("history persistence failed: {0}")]
    PersistenceFailed(String),
    /// `start()` was issued while a capture is already running.
    #[error("a capture session is already active")]
    AlreadyActive,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

/// Coarse, copyable classification of a [`MonitorError`], used where the
/// error has to be stored in session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    ClassificationFailed,
    PersistenceFailed,
    AlreadyActive,
    Other,
}

impl MonitorError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::ClassificationFailed(_) => ErrorKind::ClassificationFailed,
            Self::PersistenceFailed(_) => ErrorKind::PersistenceFailed,
            Self::AlreadyActive => ErrorKind::AlreadyActive,
            _ => ErrorKind::Other,
        }
    }

    /// Whether this error terminates the capture session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::DeviceUnavailable(_))
    }
}

impl From<&str> for MonitorError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MonitorError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(value: serde_json::Error) -> Self {
        Self::msg(format!("json: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_are_fatal() {
        assert!(MonitorError::PermissionDenied.is_fatal());
        assert!(MonitorError::DeviceUnavailable("gone".into()).is_fatal());
        assert!(!MonitorError::ClassificationFailed("timeout".into()).is_fatal());
        assert!(!MonitorError::PersistenceFailed("disk full".into()).is_fatal());
    }

    #[test]
    fn messages_name_what_failed() {
        let err = MonitorError::DeviceUnavailable("no default input device".into());
        assert_eq!(
            err.to_string(),
            "audio input unavailable: no default input device"
        );
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }
}
