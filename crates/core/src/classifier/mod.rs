//! Classification backends.
//!
//! [`RestClassifier`] talks to the detection service over HTTP.
//! [`SimulatedClassifier`] returns canned results for demos and for running
//! the monitor without a backend.

use std::{cell::RefCell, collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    audio::AudioSegment,
    prediction::{ClassLabel, Classifier, PredictionResult},
    BackendConfig, MonitorError, Result,
};

/// HTTP client for the detection backend.
///
/// `POST {base}/predict` with the audio as multipart field `audio`;
/// `GET {base}/health` and `GET {base}/model/info` for diagnostics.
#[derive(Debug, Clone)]
pub struct RestClassifier {
    base_url: String,
    client: reqwest::Client,
}

impl RestClassifier {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| MonitorError::Config(format!("http client: {err}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Backend liveness check; returns the response body.
    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get_json("health").await
    }

    /// Metadata about the deployed model.
    pub async fn model_info(&self) -> Result<serde_json::Value> {
        self.get_json("model/info").await
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.endpoint(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| MonitorError::msg(format!("GET {url} failed: {err}")))?;

        if !resp.status().is_success() {
            return Err(MonitorError::msg(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|err| MonitorError::msg(format!("GET {url}: invalid body: {err}")))
    }
}

#[async_trait(?Send)]
impl Classifier for RestClassifier {
    fn name(&self) -> &str {
        "rest"
    }

    async fn classify(&self, segment: &AudioSegment) -> Result<PredictionResult> {
        let wav = segment.to_wav_bytes()?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .map_err(|err| MonitorError::ClassificationFailed(format!("mime: {err}")))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let url = self.endpoint("predict");
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| MonitorError::ClassificationFailed(format!("request failed: {err}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|err| MonitorError::ClassificationFailed(format!("reading body: {err}")))?;
        if !status.is_success() {
            return Err(MonitorError::ClassificationFailed(format!(
                "backend returned {status}: {body}"
            )));
        }

        PredictionResult::from_json(&body)
    }
}

/// Canned outcomes of the simulated backend: label, then tank, pedestrian
/// and light-vehicle scores.
const CANNED: [(ClassLabel, [f32; 3]); 3] = [
    (ClassLabel::Tank, [0.89, 0.07, 0.04]),
    (ClassLabel::Pedestrian, [0.15, 0.76, 0.09]),
    (ClassLabel::LightVehicle, [0.12, 0.06, 0.82]),
];

/// Stand-in backend that answers after a fixed latency with one of three
/// canned results picked at random.
#[derive(Debug)]
pub struct SimulatedClassifier {
    latency: Duration,
    rng: RefCell<StdRng>,
}

impl SimulatedClassifier {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(1_500),
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests and reproducible demos.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            latency: Duration::from_millis(1_500),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn draw(&self, segment: &AudioSegment) -> Result<PredictionResult> {
        let mut rng = self.rng.borrow_mut();
        let (label, [tank, pedestrian, light_vehicle]) = CANNED[rng.gen_range(0..CANNED.len())];
        let processing = rng.gen_range(0.3..0.8);

        let scores = BTreeMap::from([
            (ClassLabel::Tank, tank),
            (ClassLabel::Pedestrian, pedestrian),
            (ClassLabel::LightVehicle, light_vehicle),
        ]);
        PredictionResult::new(
            label,
            scores[&label],
            scores,
            Utc::now(),
            format!("{processing:.2}s"),
            format!("{:.1}s", segment.duration().as_secs_f32()),
        )
    }
}

impl Default for SimulatedClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Classifier for SimulatedClassifier {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn classify(&self, segment: &AudioSegment) -> Result<PredictionResult> {
        tokio::time::sleep(self.latency).await;
        self.draw(segment)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;

    /// Serves one HTTP request with `status` and `body`, handing the raw
    /// request back through the join handle.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut payload = vec![0u8; content_length];
            reader.read_exact(&mut payload).unwrap();

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            head + &String::from_utf8_lossy(&payload)
        });
        (base, handle)
    }

    fn backend(base_url: String) -> RestClassifier {
        RestClassifier::new(&BackendConfig {
            base_url,
            timeout_ms: 5_000,
        })
        .unwrap()
    }

    #[test]
    fn endpoints_join_cleanly() {
        let classifier = backend("http://localhost:5000/api/".to_string());
        assert_eq!(classifier.base_url(), "http://localhost:5000/api");
        assert_eq!(
            classifier.endpoint("/predict"),
            "http://localhost:5000/api/predict"
        );
        assert_eq!(
            classifier.endpoint("model/info"),
            "http://localhost:5000/api/model/info"
        );
    }

    #[tokio::test]
    async fn posts_wav_segment_and_parses_prediction() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"type":"pedestrian","confidence":0.76,"tank":0.15,"pedestrian":0.76,"light_vehicle":0.09}"#,
        );
        let classifier = backend(base);
        let segment = AudioSegment::new(vec![0.0; 1_600], 16_000);

        let result = classifier.classify(&segment).await.unwrap();
        assert_eq!(result.class_label(), ClassLabel::Pedestrian);
        assert_eq!(result.score(ClassLabel::Tank), 0.15);

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /api/predict HTTP/1.1"));
        assert!(request.contains("multipart/form-data"));
        assert!(request.contains("name=\"audio\""));
        assert!(request.contains("filename=\"segment.wav\""));
        assert!(request.contains("RIFF"));
    }

    #[tokio::test]
    async fn server_errors_are_classification_failures() {
        let (base, server) = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#);
        let classifier = backend(base);
        let segment = AudioSegment::new(vec![0.0; 160], 16_000);

        let err = classifier.classify(&segment).await.unwrap_err();
        assert!(matches!(err, MonitorError::ClassificationFailed(_)));
        assert!(err.to_string().contains("503"));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn health_returns_backend_body() {
        let (base, server) = serve_once("200 OK", r#"{"status":"ok"}"#);
        let classifier = backend(base);

        let health = classifier.health().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert!(server.join().unwrap().starts_with("GET /api/health"));
    }

    #[tokio::test]
    async fn unreachable_backend_fails_the_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        drop(listener);

        let err = backend(base)
            .classify(&AudioSegment::new(vec![0.0; 16], 16_000))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::ClassificationFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_backend_answers_after_latency() {
        let classifier = SimulatedClassifier::with_seed(7);
        let segment = AudioSegment::new(vec![0.0; 48_000 * 3], 48_000);

        let started = tokio::time::Instant::now();
        let result = classifier.classify(&segment).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));

        assert_eq!(result.confidence(), result.score(result.class_label()));
        assert_eq!(result.audio_duration(), "3.0s");
        let processing: f32 = result
            .processing_time()
            .trim_end_matches('s')
            .parse()
            .unwrap();
        assert!((0.3..=0.8).contains(&processing));
    }

    #[test]
    fn simulated_results_are_canned_outcomes() {
        let classifier = SimulatedClassifier::with_seed(42);
        let segment = AudioSegment::new(vec![0.0; 10], 10);
        for _ in 0..20 {
            let result = classifier.draw(&segment).unwrap();
            let (_, scores) = CANNED
                .iter()
                .find(|(label, _)| *label == result.class_label())
                .unwrap();
            assert_eq!(result.score(ClassLabel::Tank), scores[0]);
            assert_eq!(result.score(ClassLabel::Pedestrian), scores[1]);
            assert_eq!(result.score(ClassLabel::LightVehicle), scores[2]);
        }
    }
}
