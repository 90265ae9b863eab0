//! Classification results and the periodic prediction cycle.

use std::{collections::BTreeMap, fmt, rc::Rc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    audio::AudioSegment,
    scheduler::{LocalTask, Scheduler},
    session::WeakContext,
    MonitorError, Result,
};

/// Classes the backend distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassLabel {
    Tank,
    Pedestrian,
    LightVehicle,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 3] = [Self::Tank, Self::Pedestrian, Self::LightVehicle];

    /// Wire identifier, e.g. `light_vehicle`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tank => "tank",
            Self::Pedestrian => "pedestrian",
            Self::LightVehicle => "light_vehicle",
        }
    }

    /// Upper-case label shown to operators.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Tank => "TANK",
            Self::Pedestrian => "PEDESTRIAN",
            Self::LightVehicle => "LIGHT VEHICLE",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classification outcome. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WirePrediction", into = "WirePrediction")]
pub struct PredictionResult {
    class_label: ClassLabel,
    confidence: f32,
    per_class_scores: BTreeMap<ClassLabel, f32>,
    timestamp: DateTime<Utc>,
    processing_time: String,
    audio_duration: String,
}

impl PredictionResult {
    /// Builds a result, rejecting confidences or scores outside `[0, 1]`.
    /// Classes missing from `per_class_scores` score zero.
    pub fn new(
        class_label: ClassLabel,
        confidence: f32,
        per_class_scores: BTreeMap<ClassLabel, f32>,
        timestamp: DateTime<Utc>,
        processing_time: impl Into<String>,
        audio_duration: impl Into<String>,
    ) -> Result<Self> {
        if !is_probability(confidence) {
            return Err(MonitorError::ClassificationFailed(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }

        let mut scores = BTreeMap::new();
        for label in ClassLabel::ALL {
            let score = per_class_scores.get(&label).copied().unwrap_or(0.0);
            if !is_probability(score) {
                return Err(MonitorError::ClassificationFailed(format!(
                    "score {score} for {label} outside [0, 1]"
                )));
            }
            scores.insert(label, score);
        }

        Ok(Self {
            class_label,
            confidence,
            per_class_scores: scores,
            timestamp,
            processing_time: processing_time.into(),
            audio_duration: audio_duration.into(),
        })
    }

    /// Parses a backend response body.
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|err| MonitorError::ClassificationFailed(format!("malformed response: {err}")))
    }

    pub fn class_label(&self) -> ClassLabel {
        self.class_label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn score(&self, label: ClassLabel) -> f32 {
        self.per_class_scores.get(&label).copied().unwrap_or(0.0)
    }

    pub fn per_class_scores(&self) -> &BTreeMap<ClassLabel, f32> {
        &self.per_class_scores
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn processing_time(&self) -> &str {
        &self.processing_time
    }

    pub fn audio_duration(&self) -> &str {
        &self.audio_duration
    }
}

fn is_probability(value: f32) -> bool {
    (0.0..=1.0).contains(&value)
}

const UNKNOWN: &str = "--";

/// JSON shape exchanged with the backend and stored by presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePrediction {
    #[serde(rename = "type")]
    class_label: ClassLabel,
    confidence: f32,
    #[serde(default)]
    tank: f32,
    #[serde(default)]
    pedestrian: f32,
    #[serde(default, rename = "light_vehicle")]
    light_vehicle: f32,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    processing_time: Option<String>,
    #[serde(default)]
    audio_duration: Option<String>,
}

impl TryFrom<WirePrediction> for PredictionResult {
    type Error = MonitorError;

    fn try_from(wire: WirePrediction) -> Result<Self> {
        let scores = BTreeMap::from([
            (ClassLabel::Tank, wire.tank),
            (ClassLabel::Pedestrian, wire.pedestrian),
            (ClassLabel::LightVehicle, wire.light_vehicle),
        ]);
        Self::new(
            wire.class_label,
            wire.confidence,
            scores,
            wire.timestamp.unwrap_or_else(Utc::now),
            wire.processing_time.unwrap_or_else(|| UNKNOWN.to_string()),
            wire.audio_duration.unwrap_or_else(|| UNKNOWN.to_string()),
        )
    }
}

impl From<PredictionResult> for WirePrediction {
    fn from(result: PredictionResult) -> Self {
        Self {
            class_label: result.class_label,
            confidence: result.confidence,
            tank: result.score(ClassLabel::Tank),
            pedestrian: result.score(ClassLabel::Pedestrian),
            light_vehicle: result.score(ClassLabel::LightVehicle),
            timestamp: Some(result.timestamp),
            processing_time: Some(result.processing_time),
            audio_duration: Some(result.audio_duration),
        }
    }
}

/// Classification backend.
///
/// Calls happen on the local task set, so implementations need not be
/// `Send`.
#[async_trait(?Send)]
pub trait Classifier {
    fn name(&self) -> &str;

    async fn classify(&self, segment: &AudioSegment) -> Result<PredictionResult>;
}

/// Supplies the audio window for the next request, or `None` once the
/// capture it reads from has gone away.
pub type SegmentSource = Box<dyn FnMut() -> Option<AudioSegment>>;

/// Repeating classify-then-wait loop bound to one session epoch.
pub struct PredictionCycle {
    context: WeakContext,
    epoch: u64,
    classifier: Rc<dyn Classifier>,
    scheduler: Rc<dyn Scheduler>,
    source: SegmentSource,
    interval: Duration,
    timeout: Option<Duration>,
}

impl PredictionCycle {
    pub fn new(
        context: WeakContext,
        epoch: u64,
        classifier: Rc<dyn Classifier>,
        scheduler: Rc<dyn Scheduler>,
        source: SegmentSource,
    ) -> Self {
        Self {
            context,
            epoch,
            classifier,
            scheduler,
            source,
            interval: Duration::from_secs(5),
            timeout: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The cycle as a task, ready to be scheduled. It ends by itself once
    /// the session is no longer active for this epoch.
    pub fn begin(self) -> LocalTask {
        Box::pin(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(
            epoch = self.epoch,
            classifier = self.classifier.name(),
            "prediction cycle started"
        );
        while self.still_active() {
            let Some(segment) = (self.source)() else {
                break;
            };
            self.iterate(&segment).await;

            if !self.still_active() {
                break;
            }
            self.scheduler.sleep(self.interval).await;
        }
        tracing::debug!(epoch = self.epoch, "prediction cycle ended");
    }

    async fn iterate(&self, segment: &AudioSegment) {
        self.set_processing(true);
        let outcome = self.classify(segment).await;
        self.set_processing(false);

        match outcome {
            Ok(result) => {
                let applied = self
                    .context
                    .upgrade()
                    .map(|context| context.apply_prediction(self.epoch, result))
                    .unwrap_or(false);
                if !applied {
                    tracing::debug!(epoch = self.epoch, "discarding result for inactive session");
                }
            }
            Err(err) => {
                tracing::warn!(epoch = self.epoch, error = %err, "classification skipped");
            }
        }
    }

    async fn classify(&self, segment: &AudioSegment) -> Result<PredictionResult> {
        let call = self.classifier.classify(segment);
        match self.timeout {
            Some(limit) => {
                tokio::select! {
                    outcome = call => outcome,
                    _ = self.scheduler.sleep(limit) => Err(MonitorError::ClassificationFailed(
                        format!("no response within {} ms", limit.as_millis()),
                    )),
                }
            }
            None => call.await,
        }
    }

    fn still_active(&self) -> bool {
        self.context
            .upgrade()
            .map(|context| context.is_active_epoch(self.epoch))
            .unwrap_or(false)
    }

    fn set_processing(&self, processing: bool) {
        if let Some(context) = self.context.upgrade() {
            context.set_processing(self.epoch, processing);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_backend_response() {
        let body = r#"{
            "type": "tank",
            "confidence": 0.89,
            "tank": 0.89,
            "pedestrian": 0.07,
            "light_vehicle": 0.04,
            "timestamp": "2024-05-01T12:00:00Z",
            "processingTime": "0.42s",
            "audioDuration": "3.0s"
        }"#;

        let result = PredictionResult::from_json(body).unwrap();
        assert_eq!(result.class_label(), ClassLabel::Tank);
        assert_eq!(result.confidence(), 0.89);
        assert_eq!(result.score(ClassLabel::Pedestrian), 0.07);
        assert_eq!(result.score(ClassLabel::LightVehicle), 0.04);
        assert_eq!(
            result.timestamp(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(result.processing_time(), "0.42s");
        assert_eq!(result.audio_duration(), "3.0s");
    }

    #[test]
    fn missing_optional_fields_get_defaults() {
        let result =
            PredictionResult::from_json(r#"{ "type": "light_vehicle", "confidence": 0.8 }"#)
                .unwrap();
        assert_eq!(result.class_label(), ClassLabel::LightVehicle);
        assert_eq!(result.score(ClassLabel::Tank), 0.0);
        assert_eq!(result.per_class_scores().len(), 3);
        assert_eq!(result.processing_time(), "--");
        assert_eq!(result.audio_duration(), "--");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let err = PredictionResult::from_json(r#"{ "type": "tank", "confidence": 1.5 }"#)
            .unwrap_err();
        assert!(matches!(err, MonitorError::ClassificationFailed(_)));

        let err = PredictionResult::from_json(
            r#"{ "type": "tank", "confidence": 0.5, "pedestrian": -0.1 }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("pedestrian"));
    }

    #[test]
    fn rejects_unknown_class() {
        let err = PredictionResult::from_json(r#"{ "type": "bicycle", "confidence": 0.5 }"#)
            .unwrap_err();
        assert!(matches!(err, MonitorError::ClassificationFailed(_)));
    }

    #[test]
    fn serializes_back_to_wire_shape() {
        let result = PredictionResult::new(
            ClassLabel::Pedestrian,
            0.76,
            BTreeMap::from([(ClassLabel::Pedestrian, 0.76)]),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            "0.50s",
            "3.0s",
        )
        .unwrap();

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "pedestrian");
        assert_eq!(json["light_vehicle"], 0.0);
        assert_eq!(json["processingTime"], "0.50s");
        assert_eq!(json["audioDuration"], "3.0s");
    }

    #[test]
    fn labels_have_operator_names() {
        assert_eq!(ClassLabel::LightVehicle.display_name(), "LIGHT VEHICLE");
        assert_eq!(ClassLabel::LightVehicle.to_string(), "light_vehicle");
    }
}
