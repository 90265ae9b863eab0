//! Volume and dominant-frequency metrics computed from analyser frames.
//!
//! The frequency estimate is deliberately coarse: it reports the centre of
//! the single loudest bin, so its resolution is `sample_rate / transform_size`
//! (about 21.5 Hz at 44.1 kHz with a 2048-point transform) and it ignores
//! secondary peaks and harmonics entirely.

use serde::{Deserialize, Serialize};

use crate::audio::{SampleFrame, SampleStream};

/// Lowest level shown by meters. Anything quieter, including digital
/// silence, is displayed at this floor.
pub const DISPLAY_FLOOR_DB: f32 = -60.0;

/// Metrics derived from one pair of analyser frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalMetrics {
    pub volume_db: f32,
    pub dominant_freq_hz: f32,
}

impl Default for SignalMetrics {
    fn default() -> Self {
        Self {
            volume_db: f32::NEG_INFINITY,
            dominant_freq_hz: 0.0,
        }
    }
}

/// RMS level of a time-domain frame in decibels relative to full scale.
///
/// Silent or empty frames return negative infinity; the result is never NaN.
pub fn compute_volume_db(frame: &SampleFrame) -> f32 {
    let samples = frame.as_slice();
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }

    let sum: f32 = samples
        .iter()
        .map(|&raw| {
            let normalized = (f32::from(raw) - 128.0) / 128.0;
            normalized * normalized
        })
        .sum();
    let rms = (sum / samples.len() as f32).sqrt();
    if rms <= 0.0 {
        return f32::NEG_INFINITY;
    }

    20.0 * rms.log10()
}

/// Frequency of the loudest bin of a frequency-domain frame.
///
/// Ties resolve to the lowest bin. An all-zero frame reports bin 0.
pub fn compute_dominant_frequency(
    frame: &SampleFrame,
    sample_rate_hz: u32,
    transform_size: usize,
) -> f32 {
    if transform_size == 0 {
        return 0.0;
    }

    let mut max_value = 0u8;
    let mut max_index = 0usize;
    for (index, &value) in frame.as_slice().iter().enumerate() {
        if value > max_value {
            max_value = value;
            max_index = index;
        }
    }

    max_index as f32 * sample_rate_hz as f32 / transform_size as f32
}

/// Clamps a level to the meter range, mapping silence and NaN to the floor.
pub fn display_volume_db(db: f32) -> f32 {
    if db.is_nan() {
        return DISPLAY_FLOOR_DB;
    }
    db.clamp(DISPLAY_FLOOR_DB, 0.0)
}

/// Position of a level on a 0..=100 meter spanning the display range.
pub fn volume_percent(db: f32) -> f32 {
    let clamped = display_volume_db(db);
    ((clamped - DISPLAY_FLOOR_DB) / -DISPLAY_FLOOR_DB * 100.0).clamp(0.0, 100.0)
}

/// Per-tick driver that pulls fresh frames from a stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsEngine;

impl MetricsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self, stream: &mut dyn SampleStream) -> SignalMetrics {
        let time_domain = stream.read_time_domain();
        let frequency_domain = stream.read_frequency_domain();

        SignalMetrics {
            volume_db: compute_volume_db(&time_domain),
            dominant_freq_hz: compute_dominant_frequency(
                &frequency_domain,
                stream.sample_rate(),
                stream.transform_size(),
            ),
        }
    }
}
