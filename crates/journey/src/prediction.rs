//! Prediction adapter: asks an external classifier for a session's stage.
//!
//! Backends report raw `{stage, confidence}` pairs. The adapter bounds every
//! call with a timeout, validates the answer, and turns every failure into an
//! `Unknown` prediction carrying the error text. It never returns an error and
//! never retries within a call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use journey_core::event_bus::{make_event, noop_sink, EngineEventKind, EventSink};
use journey_core::types::{Event, Stage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Input handed to a backend: the session and its most recent events,
/// oldest first. Serialized with snake_case keys throughout, matching the
/// nested events.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRequest {
    pub session_id: String,
    pub events: Vec<Event>,
}

impl PredictionRequest {
    pub fn new(session_id: &str, events: &[Event], max_events: usize) -> Self {
        let skip = events.len().saturating_sub(max_events);
        Self {
            session_id: session_id.to_string(),
            events: events[skip..].to_vec(),
        }
    }
}

/// Unvalidated backend answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    pub stage: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("prediction backend unavailable: {0}")]
    Unavailable(String),
    #[error("prediction process failed: {0}")]
    ProcessFailed(String),
    #[error("malformed prediction: {0}")]
    Malformed(String),
    #[error("prediction timed out after {0:?}")]
    Timeout(Duration),
    #[error("prediction transport error: {0}")]
    Transport(String),
}

impl PredictionError {
    fn reason(&self) -> &'static str {
        match self {
            PredictionError::Unavailable(_) => "unavailable",
            PredictionError::ProcessFailed(_) => "process_failed",
            PredictionError::Malformed(_) => "malformed",
            PredictionError::Timeout(_) => "timeout",
            PredictionError::Transport(_) => "transport",
        }
    }
}

#[async_trait]
pub trait PredictionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, PredictionError>;
}

/// Validated adapter output.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub stage: Stage,
    pub confidence: f64,
    pub error: Option<String>,
}

impl Prediction {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            stage: Stage::Unknown,
            confidence: 0.0,
            error: Some(error.into()),
        }
    }

    /// A prediction the reconciler may prefer over the rule stage.
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && self.stage != Stage::Unknown
    }
}

/// Parse and range-check a raw backend answer.
pub fn validate(raw: RawPrediction) -> Result<Prediction, PredictionError> {
    let stage = raw
        .stage
        .parse::<Stage>()
        .map_err(PredictionError::Malformed)?;
    if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
        return Err(PredictionError::Malformed(format!(
            "confidence {} outside [0, 1]",
            raw.confidence
        )));
    }
    Ok(Prediction {
        stage,
        confidence: raw.confidence,
        error: None,
    })
}

pub struct PredictionAdapter {
    backend: Arc<dyn PredictionBackend>,
    timeout: Duration,
    max_events: usize,
    event_sink: Arc<dyn EventSink>,
}

impl PredictionAdapter {
    pub fn new(backend: Arc<dyn PredictionBackend>, timeout: Duration, max_events: usize) -> Self {
        Self {
            backend,
            timeout,
            max_events,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn predict(&self, session_id: &str, events: &[Event]) -> Prediction {
        let request = PredictionRequest::new(session_id, events, self.max_events);
        let backend = self.backend.name().to_string();
        metrics::counter!("journey.prediction.requests", "backend" => backend.clone()).increment(1);

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.backend.predict(&request)).await {
            Ok(Ok(raw)) => validate(raw),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PredictionError::Timeout(self.timeout)),
        };
        metrics::histogram!("journey.prediction.latency_ms", "backend" => backend.clone())
            .record(start.elapsed().as_millis() as f64);

        match result {
            Ok(prediction) => {
                debug!(
                    session_id = %session_id,
                    stage = %prediction.stage,
                    confidence = prediction.confidence,
                    "Prediction received"
                );
                prediction
            }
            Err(e) => {
                metrics::counter!(
                    "journey.prediction.failures",
                    "backend" => backend,
                    "reason" => e.reason()
                )
                .increment(1);
                // A disabled backend is the normal rules-only mode.
                if matches!(e, PredictionError::Unavailable(_)) {
                    debug!(session_id = %session_id, error = %e, "Prediction unavailable");
                } else {
                    warn!(session_id = %session_id, error = %e, "Prediction degraded to Unknown");
                    self.event_sink.emit(
                        make_event(
                            EngineEventKind::PredictionDegraded,
                            Some(session_id),
                            Some(Stage::Unknown),
                            None,
                        )
                        .with_detail(e.to_string()),
                    );
                }
                Prediction::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DisabledBackend, FailingBackend, StaticBackend};
    use journey_core::event_bus::capture_sink;
    use journey_core::types::EventName;
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString,
        Unit,
    };
    use std::collections::HashMap;

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| Event {
                id: uuid::Uuid::new_v4(),
                session_id: "s1".into(),
                event_name: EventName::PageView,
                timestamp: chrono::Utc::now(),
                metadata: Default::default(),
                sequence: i as u64,
            })
            .collect()
    }

    /// Counts counter increments by metric name.
    #[derive(Default)]
    struct CountingRecorder {
        counts: Arc<parking_lot::Mutex<HashMap<String, u64>>>,
    }

    struct NamedCounter {
        name: String,
        counts: Arc<parking_lot::Mutex<HashMap<String, u64>>>,
    }

    impl CounterFn for NamedCounter {
        fn increment(&self, value: u64) {
            *self.counts.lock().entry(self.name.clone()).or_default() += value;
        }

        fn absolute(&self, value: u64) {
            self.counts.lock().insert(self.name.clone(), value);
        }
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(Arc::new(NamedCounter {
                name: key.name().to_string(),
                counts: self.counts.clone(),
            }))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    impl CountingRecorder {
        fn count(&self, name: &str) -> u64 {
            self.counts.lock().get(name).copied().unwrap_or(0)
        }
    }

    #[test]
    fn test_every_call_counts_as_a_request() {
        let recorder = CountingRecorder::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ok = PredictionAdapter::new(
            Arc::new(StaticBackend::new("Intent", 0.9)),
            Duration::from_secs(1),
            10,
        );
        let failing = PredictionAdapter::new(
            Arc::new(FailingBackend::new("exit 2")),
            Duration::from_secs(1),
            10,
        );

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                ok.predict("s1", &events(1)).await;
                failing.predict("s1", &events(1)).await;
            })
        });

        assert_eq!(recorder.count("journey.prediction.requests"), 2);
        assert_eq!(recorder.count("journey.prediction.failures"), 1);
    }

    #[test]
    fn test_request_payload_uses_snake_case_keys() {
        let request = PredictionRequest::new("s1", &events(1), 10);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert!(json.get("sessionId").is_none());
        assert_eq!(json["events"][0]["event_name"], "page_view");
    }

    #[test]
    fn test_request_keeps_most_recent_events() {
        let all = events(5);
        let request = PredictionRequest::new("s1", &all, 2);
        assert_eq!(request.events.len(), 2);
        assert_eq!(request.events[0].sequence, 3);
        assert_eq!(request.events[1].sequence, 4);
        assert_eq!(PredictionRequest::new("s1", &all, 10).events.len(), 5);
    }

    #[test]
    fn test_validate_rejects_bad_answers() {
        let ok = validate(RawPrediction { stage: "intent".into(), confidence: 0.8 }).unwrap();
        assert_eq!(ok.stage, Stage::Intent);
        assert!(ok.is_usable());

        for raw in [
            RawPrediction { stage: "browsing".into(), confidence: 0.5 },
            RawPrediction { stage: "Intent".into(), confidence: 1.5 },
            RawPrediction { stage: "Intent".into(), confidence: f64::NAN },
        ] {
            assert!(matches!(validate(raw), Err(PredictionError::Malformed(_))));
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let adapter = PredictionAdapter::new(
            Arc::new(StaticBackend::new("Decision", 0.73)),
            Duration::from_secs(1),
            10,
        );
        let prediction = adapter.predict("s1", &events(1)).await;
        assert_eq!(prediction.stage, Stage::Decision);
        assert_eq!(prediction.confidence, 0.73);
        assert!(prediction.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_becomes_unknown_with_error() {
        let sink = capture_sink();
        let adapter = PredictionAdapter::new(
            Arc::new(FailingBackend::new("model crashed")),
            Duration::from_secs(1),
            10,
        )
        .with_event_sink(sink.clone());

        let prediction = adapter.predict("s1", &events(1)).await;
        assert_eq!(prediction.stage, Stage::Unknown);
        assert_eq!(prediction.confidence, 0.0);
        assert!(prediction.error.unwrap().contains("model crashed"));
        assert_eq!(sink.count_kind(EngineEventKind::PredictionDegraded), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_unknown() {
        let adapter = PredictionAdapter::new(
            Arc::new(StaticBackend::new("Purchase", 0.9).with_delay(Duration::from_secs(30))),
            Duration::from_millis(100),
            10,
        );
        let prediction = adapter.predict("s1", &events(1)).await;
        assert_eq!(prediction.stage, Stage::Unknown);
        assert!(prediction.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disabled_backend_is_quiet() {
        let sink = capture_sink();
        let adapter =
            PredictionAdapter::new(Arc::new(DisabledBackend), Duration::from_secs(1), 10)
                .with_event_sink(sink.clone());
        let prediction = adapter.predict("s1", &events(1)).await;
        assert!(!prediction.is_usable());
        assert_eq!(sink.count(), 0);
    }
}
