//! Live sample sources.
//!
//! A [`SampleStream`] is the handle a capture session holds while it is
//! active. Reads never block and never fail; device faults are reported out of
//! band through [`SampleStream::take_error`].

mod analyser;
mod cpal_input;

use std::{io::Cursor, time::Duration};

use crate::{AudioConfig, MonitorError, Result};

pub use analyser::Analyser;
pub use cpal_input::{CpalDevice, CpalStream};

/// One analyser frame of unsigned 8-bit values.
///
/// Time-domain frames are centred on 128; frequency-domain frames hold
/// magnitudes scaled onto 0..=255.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleFrame {
    bytes: Vec<u8>,
}

impl SampleFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Processing requested from the host when opening an input.
///
/// The three processing switches are always on; they are not user tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub transform_size: usize,
    /// How much recent audio the stream must keep for classification.
    pub retain: Duration,
}

impl DeviceConstraints {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            transform_size: config.fft_size,
            retain: config.capture_window(),
        }
    }
}

/// Opens sample streams on an input device.
pub trait AudioDevice {
    /// Opens the device. The returned stream is not yet running.
    fn acquire(&self, constraints: &DeviceConstraints) -> Result<Box<dyn SampleStream>>;
}

/// Handle on an acquired input.
pub trait SampleStream {
    fn sample_rate(&self) -> u32;

    fn transform_size(&self) -> usize;

    /// Opens the processing context and begins delivering samples.
    fn start(&mut self) -> Result<()>;

    /// Most recent time-domain frame (`transform_size / 2` bytes).
    fn read_time_domain(&mut self) -> SampleFrame;

    /// Most recent frequency-domain frame (`transform_size / 2` bins).
    fn read_frequency_domain(&mut self) -> SampleFrame;

    /// The most recent `window` of mono audio.
    fn capture_segment(&mut self, window: Duration) -> AudioSegment;

    /// Takes the last device fault observed since the previous call, if any.
    fn take_error(&mut self) -> Option<MonitorError>;

    /// Stops the device tracks and closes the processing context.
    /// Calling it again is a no-op.
    fn release(&mut self) -> Result<()>;
}

/// A window of captured mono audio, as submitted for classification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Encodes the segment as a 16-bit PCM mono WAV file.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        if self.sample_rate == 0 {
            return Err(MonitorError::InvalidInput("segment has no sample rate"));
        }

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
            for &sample in &self.samples {
                let scaled = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                writer.write_sample(scaled).map_err(wav_error)?;
            }
            writer.finalize().map_err(wav_error)?;
        }
        Ok(cursor.into_inner())
    }
}

fn wav_error(err: hound::Error) -> MonitorError {
    MonitorError::msg(format!("wav encoding failed: {err}"))
}
