use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::{Analyser, AudioDevice, AudioSegment, DeviceConstraints, SampleFrame, SampleStream};
use crate::{MonitorError, Result};

type SharedFault = Arc<Mutex<Option<MonitorError>>>;

/// The host's default input device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevice;

impl CpalDevice {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDevice for CpalDevice {
    fn acquire(&self, constraints: &DeviceConstraints) -> Result<Box<dyn SampleStream>> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MonitorError::DeviceUnavailable("no default input device".into()))?;

        let supported = device
            .default_input_config()
            .map_err(|err| map_host_error("input config", err))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        // cpal exposes no voice processing; the request is recorded only.
        tracing::debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            host = ?host.id(),
            "input processing requested but not applied by host"
        );

        let analyser = Analyser::new(
            config.sample_rate.0,
            constraints.transform_size,
            constraints.retain,
        )?;

        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "acquired audio input"
        );

        Ok(Box::new(CpalStream {
            device,
            config,
            sample_format,
            stream: None,
            analyser: Arc::new(Mutex::new(analyser)),
            fault: Arc::new(Mutex::new(None)),
            released: false,
        }))
    }
}

/// Running (or ready to run) cpal input stream feeding an [`Analyser`].
pub struct CpalStream {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    analyser: Arc<Mutex<Analyser>>,
    fault: SharedFault,
    released: bool,
}

impl CpalStream {
    fn analyser(&self) -> MutexGuard<'_, Analyser> {
        // The callback never panics while holding the lock, but a poisoned
        // analyser is still usable for reads.
        self.analyser
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SampleStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn transform_size(&self) -> usize {
        self.analyser().transform_size()
    }

    fn start(&mut self) -> Result<()> {
        if self.released {
            return Err(MonitorError::DeviceUnavailable(
                "stream was already released".into(),
            ));
        }
        if self.stream.is_some() {
            return Ok(());
        }

        let analyser = self.analyser.clone();
        let fault = self.fault.clone();
        let stream = match self.sample_format {
            SampleFormat::F32 => build_stream::<f32>(&self.device, &self.config, analyser, fault)?,
            SampleFormat::I16 => build_stream::<i16>(&self.device, &self.config, analyser, fault)?,
            SampleFormat::U16 => build_stream::<u16>(&self.device, &self.config, analyser, fault)?,
            other => {
                return Err(MonitorError::DeviceUnavailable(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|err| map_host_error("start stream", err))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn read_time_domain(&mut self) -> SampleFrame {
        self.analyser().time_domain_frame()
    }

    fn read_frequency_domain(&mut self) -> SampleFrame {
        self.analyser().frequency_frame()
    }

    fn capture_segment(&mut self, window: Duration) -> AudioSegment {
        self.analyser().segment(window)
    }

    fn take_error(&mut self) -> Option<MonitorError> {
        self.fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let paused = stream.pause();
        // Dropping the stream closes it on the host side.
        drop(stream);
        self.analyser().reset();
        tracing::debug!("audio input released");

        paused.map_err(|err| map_host_error("stop stream", err))
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "audio input release on drop failed");
        }
    }
}

impl fmt::Debug for CpalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalStream")
            .field("sample_rate", &self.config.sample_rate.0)
            .field("channels", &self.config.channels)
            .field("sample_format", &self.sample_format)
            .field("running", &self.stream.is_some())
            .field("released", &self.released)
            .finish()
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    analyser: Arc<Mutex<Analyser>>,
    fault: SharedFault,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut feed = InputFeed::new(
        analyser,
        usize::from(config.channels),
        config.sample_rate.0 as usize,
    );

    let err_fn = move |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio input stream error");
        let mut slot = fault.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(map_host_error("input stream", err));
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| feed.push(data),
            err_fn,
            None,
        )
        .map_err(|err| map_host_error("build stream", err))
}

/// Hands interleaved device samples to the analyser as mono.
///
/// Runs on the audio thread, so it never waits on the analyser lock: while
/// the lock is held elsewhere samples queue up, keeping at most `backlog`.
struct InputFeed {
    analyser: Arc<Mutex<Analyser>>,
    channels: usize,
    backlog: usize,
    pending: Vec<f32>,
}

impl InputFeed {
    fn new(analyser: Arc<Mutex<Analyser>>, channels: usize, backlog: usize) -> Self {
        Self {
            analyser,
            channels: channels.max(1),
            backlog,
            pending: Vec::with_capacity(backlog),
        }
    }

    fn push<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        self.pending.extend(data.chunks(self.channels).map(|frame| {
            frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
        }));

        if let Ok(mut analyser) = self.analyser.try_lock() {
            analyser.push(&self.pending);
            self.pending.clear();
        } else if self.pending.len() > self.backlog {
            let excess = self.pending.len() - self.backlog;
            self.pending.drain(..excess);
        }
    }
}

/// Maps a host error onto the device taxonomy. Hosts report permission
/// problems only as backend-specific text.
pub(crate) fn map_host_error(context: &str, err: impl fmt::Display) -> MonitorError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MonitorError::PermissionDenied
    } else {
        MonitorError::DeviceUnavailable(format!("{context}: {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_analyser() -> Arc<Mutex<Analyser>> {
        let analyser = Analyser::new(48_000, 2048, Duration::from_secs(3)).unwrap();
        Arc::new(Mutex::new(analyser))
    }

    #[test]
    fn interleaved_frames_are_downmixed_to_mono() {
        let shared = shared_analyser();
        let mut feed = InputFeed::new(shared.clone(), 2, 48_000);

        feed.push(&[0.5f32, -0.5, 1.0, 0.0]);

        assert_eq!(shared.lock().unwrap().buffered(), 2);
        assert!(feed.pending.is_empty());
    }

    #[test]
    fn busy_analyser_queues_samples_instead_of_waiting() {
        let shared = shared_analyser();
        let mut feed = InputFeed::new(shared.clone(), 1, 4);

        {
            let _held = shared.lock().unwrap();
            feed.push(&[0.1f32; 3]);
            feed.push(&[0.2f32; 3]);
            // Oldest samples beyond the backlog are dropped.
            assert_eq!(feed.pending, vec![0.1, 0.2, 0.2, 0.2]);
        }

        feed.push(&[0.3f32; 2]);
        assert!(feed.pending.is_empty());
        assert_eq!(shared.lock().unwrap().buffered(), 6);
    }

    #[test]
    fn permission_text_maps_to_permission_denied() {
        let err = map_host_error("build stream", "Access denied by the system");
        assert!(matches!(err, MonitorError::PermissionDenied));

        let err = map_host_error("build stream", "Permission to use microphone not granted");
        assert!(matches!(err, MonitorError::PermissionDenied));
    }

    #[test]
    fn other_host_errors_are_device_unavailable() {
        let err = map_host_error(
            "input config",
            "The requested device is no longer available",
        );
        match err {
            MonitorError::DeviceUnavailable(reason) => {
                assert!(reason.starts_with("input config:"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
