use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc, time::Duration};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use super::{AudioSegment, SampleFrame};
use crate::{MonitorError, Result};

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Sliding-window analyser fed by the device callback.
///
/// Produces byte frames on demand in the same shape a browser analyser node
/// does, so the metrics math works on identical inputs regardless of the
/// audio backend.
pub struct Analyser {
    sample_rate: u32,
    transform_size: usize,
    capacity: usize,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
    window: Vec<f32>,
    fft: FftResources,
}

impl Analyser {
    /// Creates an analyser keeping at least `retain` of audio.
    pub fn new(sample_rate: u32, transform_size: usize, retain: Duration) -> Result<Self> {
        if transform_size < 2 || !transform_size.is_power_of_two() {
            return Err(MonitorError::InvalidInput(
                "transform size must be a power of two",
            ));
        }

        let retained = (retain.as_secs_f64() * f64::from(sample_rate)).ceil() as usize;
        let capacity = retained.max(transform_size);

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(transform_size);
        let fft = FftResources {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        Ok(Self {
            sample_rate,
            transform_size,
            capacity,
            history: VecDeque::with_capacity(capacity),
            smoothed: vec![0.0; transform_size / 2],
            window: blackman_window(transform_size),
            fft,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn transform_size(&self) -> usize {
        self.transform_size
    }

    pub fn bin_count(&self) -> usize {
        self.transform_size / 2
    }

    pub fn buffered(&self) -> usize {
        self.history.len()
    }

    /// Appends mono samples, discarding the oldest beyond capacity.
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.history.len() == self.capacity {
                self.history.pop_front();
            }
            self.history.push_back(sample);
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.smoothed.iter_mut().for_each(|value| *value = 0.0);
    }

    /// Latest `bin_count` samples as bytes centred on 128.
    pub fn time_domain_frame(&self) -> SampleFrame {
        let len = self.bin_count();
        let recent = self.recent(len);
        let bytes = recent
            .iter()
            .map(|&sample| (128.0 + sample * 128.0).clamp(0.0, 255.0) as u8)
            .collect();
        SampleFrame::new(bytes)
    }

    /// Smoothed magnitude spectrum of the latest `transform_size` samples.
    pub fn frequency_frame(&mut self) -> SampleFrame {
        let len = self.transform_size;
        let recent = self.recent(len);
        for (index, sample) in recent.iter().enumerate() {
            self.fft.input[index] = sample * self.window[index];
        }

        if let Err(err) = self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.spectrum,
            &mut self.fft.scratch,
        ) {
            tracing::warn!(error = %err, "spectrum transform failed");
            return SampleFrame::new(vec![0; self.bin_count()]);
        }

        let scale = 1.0 / len as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut bytes = Vec::with_capacity(self.bin_count());
        for (bin, value) in self.fft.spectrum.iter().take(self.bin_count()).enumerate() {
            let magnitude = value.norm() * scale;
            let smoothed = SMOOTHING * self.smoothed[bin] + (1.0 - SMOOTHING) * magnitude;
            self.smoothed[bin] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = (255.0 / range) * (db - MIN_DECIBELS);
            bytes.push(scaled.clamp(0.0, 255.0) as u8);
        }

        SampleFrame::new(bytes)
    }

    /// The most recent `window` of audio, shorter if not yet buffered.
    pub fn segment(&self, window: Duration) -> AudioSegment {
        let wanted = (window.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        let take = wanted.min(self.history.len());
        let samples = self
            .history
            .iter()
            .skip(self.history.len() - take)
            .copied()
            .collect();
        AudioSegment::new(samples, self.sample_rate)
    }

    /// Exactly `len` samples, left-padded with silence.
    fn recent(&self, len: usize) -> Vec<f32> {
        let available = self.history.len().min(len);
        let mut out = vec![0.0; len - available];
        out.extend(self.history.iter().skip(self.history.len() - available));
        out
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for Analyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyser")
            .field("sample_rate", &self.sample_rate)
            .field("transform_size", &self.transform_size)
            .field("capacity", &self.capacity)
            .field("buffered", &self.history.len())
            .finish()
    }
}

fn blackman_window(len: usize) -> Vec<f32> {
    let alpha = 0.16;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    (0..len)
        .map(|index| {
            let x = index as f32 / len as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{compute_dominant_frequency, compute_volume_db};

    fn sine(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn rejects_odd_transform_sizes() {
        assert!(Analyser::new(44_100, 1000, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn empty_analyser_reads_as_silence() {
        let mut analyser = Analyser::new(44_100, 2048, Duration::from_secs(3)).unwrap();
        let time = analyser.time_domain_frame();
        assert_eq!(time.len(), 1024);
        assert!(time.as_slice().iter().all(|&b| b == 128));
        assert_eq!(compute_volume_db(&time), f32::NEG_INFINITY);

        let freq = analyser.frequency_frame();
        assert_eq!(freq.len(), 1024);
        assert!(freq.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn sine_peaks_near_its_frequency() {
        let sample_rate = 48_000;
        let transform_size = 2048;
        let mut analyser =
            Analyser::new(sample_rate, transform_size, Duration::from_millis(100)).unwrap();

        // Bin 20 centre: 20 * 48000 / 2048 = 468.75 Hz.
        let tone = 468.75;
        analyser.push(&sine(tone, sample_rate, 4096, 0.1));

        let mut frame = analyser.frequency_frame();
        for _ in 0..10 {
            frame = analyser.frequency_frame();
        }
        let hz = compute_dominant_frequency(&frame, sample_rate, transform_size);
        assert_eq!(hz, tone);
    }

    #[test]
    fn keeps_only_capacity_samples() {
        let mut analyser = Analyser::new(1_000, 32, Duration::from_millis(100)).unwrap();
        analyser.push(&[0.1; 250]);
        assert_eq!(analyser.buffered(), 100);

        let segment = analyser.segment(Duration::from_secs(3));
        assert_eq!(segment.samples.len(), 100);
        assert_eq!(segment.sample_rate, 1_000);
    }

    #[test]
    fn segment_returns_most_recent_samples() {
        let mut analyser = Analyser::new(10, 32, Duration::from_secs(10)).unwrap();
        let ramp: Vec<f32> = (0..50).map(|i| i as f32 / 100.0).collect();
        analyser.push(&ramp);

        let segment = analyser.segment(Duration::from_secs(1));
        assert_eq!(segment.samples.len(), 10);
        assert_eq!(segment.samples[0], 0.40);
        assert_eq!(segment.samples[9], 0.49);
    }
}
