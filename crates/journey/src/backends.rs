//! Prediction backends.
//!
//! `command` runs an external classifier process per request, `http` POSTs
//! the request to a model service, `rules` answers locally from event
//! heuristics and `disabled` always reports unavailable. The static,
//! scripted and failing backends exist for tests and demos.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use journey_core::config::{PredictionBackendKind, PredictionConfig};
use journey_core::types::Stage;
use journey_core::{JourneyError, JourneyResult};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::classifier::RuleClassifier;
use crate::prediction::{PredictionBackend, PredictionError, PredictionRequest, RawPrediction};

/// Build the backend selected in configuration.
pub fn from_config(config: &PredictionConfig) -> JourneyResult<Arc<dyn PredictionBackend>> {
    let backend: Arc<dyn PredictionBackend> = match config.backend {
        PredictionBackendKind::Disabled => Arc::new(DisabledBackend),
        PredictionBackendKind::Rules => Arc::new(RulesBackend::new()),
        PredictionBackendKind::Command => Arc::new(CommandBackend::new(
            config.command.clone(),
            config.args.clone(),
        )),
        PredictionBackendKind::Http => Arc::new(
            HttpBackend::new(
                config.url.clone(),
                Duration::from_millis(config.timeout_ms),
            )
            .map_err(|e| JourneyError::Config(e.to_string()))?,
        ),
    };
    info!(
        backend = backend.name(),
        timeout_ms = config.timeout_ms,
        "Prediction backend configured"
    );
    Ok(backend)
}

// ─── Disabled ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DisabledBackend;

#[async_trait]
impl PredictionBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn predict(&self, _request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        Err(PredictionError::Unavailable("no prediction backend configured".into()))
    }
}

// ─── Rules heuristic ────────────────────────────────────────────────────────

/// Local stand-in for a trained model: the rule stage, with confidence that
/// grows with the amount of supporting evidence.
#[derive(Debug, Default)]
pub struct RulesBackend {
    classifier: RuleClassifier,
}

impl RulesBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn confidence(stage: Stage, supporting: usize) -> f64 {
        let base = match stage {
            Stage::Purchase => 0.95,
            Stage::Intent => 0.8,
            Stage::Consideration => 0.7,
            Stage::Awareness => 0.6,
            Stage::Decision | Stage::Unknown => return 0.0,
        };
        (base + 0.02 * supporting.saturating_sub(1) as f64).min(0.99)
    }
}

#[async_trait]
impl PredictionBackend for RulesBackend {
    fn name(&self) -> &str {
        "rules"
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        let stage = self.classifier.classify(&request.events);
        let supporting = request
            .events
            .iter()
            .filter(|e| self.classifier.classify_names([&e.event_name]) == stage)
            .count();
        Ok(RawPrediction {
            stage: stage.as_str().to_string(),
            confidence: Self::confidence(stage, supporting),
        })
    }
}

// ─── External process ───────────────────────────────────────────────────────

/// Runs `program args... <session_id>`, writes the request JSON
/// (`{"session_id": .., "events": [..]}`) to stdin and
/// reads `{"stage": .., "confidence": ..}` from the last non-empty stdout
/// line. The child is killed if the call is dropped, including on timeout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PredictionBackend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| PredictionError::ProcessFailed(format!("encode request: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PredictionError::ProcessFailed(format!("spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Classifiers that ignore stdin may exit before reading it.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Classifier did not consume stdin");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PredictionError::ProcessFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PredictionError::ProcessFailed(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| PredictionError::Malformed("empty classifier output".into()))?;
        serde_json::from_str(line.trim()).map_err(|e| PredictionError::Malformed(e.to_string()))
    }
}

// ─── HTTP service ───────────────────────────────────────────────────────────

pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PredictionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PredictionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PredictionBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| PredictionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictionError::Transport(format!("HTTP {status}")));
        }
        response
            .json::<RawPrediction>()
            .await
            .map_err(|e| PredictionError::Malformed(e.to_string()))
    }
}

// ─── Test doubles ───────────────────────────────────────────────────────────

/// Always answers with the same stage and confidence, optionally after a
/// delay.
#[derive(Debug, Clone)]
pub struct StaticBackend {
    answer: RawPrediction,
    delay: Option<Duration>,
}

impl StaticBackend {
    pub fn new(stage: impl Into<String>, confidence: f64) -> Self {
        Self {
            answer: RawPrediction {
                stage: stage.into(),
                confidence,
            },
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl PredictionBackend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    async fn predict(&self, _request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.answer.clone())
    }
}

/// Replays queued `(delay, answer)` pairs in call order, then reports
/// unavailable.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<(Duration, RawPrediction)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, delay: Duration, stage: impl Into<String>, confidence: f64) -> Self {
        self.script.lock().push_back((
            delay,
            RawPrediction {
                stage: stage.into(),
                confidence,
            },
        ));
        self
    }
}

#[async_trait]
impl PredictionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn predict(&self, _request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        let next = self.script.lock().pop_front();
        let Some((delay, answer)) = next else {
            return Err(PredictionError::Unavailable("script exhausted".into()));
        };
        tokio::time::sleep(delay).await;
        Ok(answer)
    }
}

#[derive(Debug, Clone)]
pub struct FailingBackend {
    message: String,
}

impl FailingBackend {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl PredictionBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn predict(&self, _request: &PredictionRequest) -> Result<RawPrediction, PredictionError> {
        Err(PredictionError::ProcessFailed(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use journey_core::types::{Event, EventName};

    fn request(names: &[&str]) -> PredictionRequest {
        let events: Vec<Event> = names
            .iter()
            .enumerate()
            .map(|(i, n)| Event {
                id: uuid::Uuid::new_v4(),
                session_id: "s1".into(),
                event_name: EventName::from(*n),
                timestamp: Utc::now(),
                metadata: Default::default(),
                sequence: i as u64,
            })
            .collect();
        PredictionRequest::new("s1", &events, 100)
    }

    #[tokio::test]
    async fn test_rules_backend_scales_confidence_with_evidence() {
        let backend = RulesBackend::new();
        let one = backend.predict(&request(&["page_view", "add_to_cart"])).await.unwrap();
        assert_eq!(one.stage, "Intent");
        assert!((one.confidence - 0.8).abs() < 1e-9);

        let three = backend
            .predict(&request(&["add_to_cart", "cta_click", "add_to_cart"]))
            .await
            .unwrap();
        assert!((three.confidence - 0.84).abs() < 1e-9);

        let none = backend.predict(&request(&[])).await.unwrap();
        assert_eq!(none.stage, "Unknown");
        assert_eq!(none.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_scripted_backend_replays_in_order() {
        let backend = ScriptedBackend::new()
            .then(Duration::ZERO, "Awareness", 0.4)
            .then(Duration::ZERO, "Intent", 0.9);
        let req = request(&["page_view"]);
        assert_eq!(backend.predict(&req).await.unwrap().stage, "Awareness");
        assert_eq!(backend.predict(&req).await.unwrap().stage, "Intent");
        assert!(matches!(
            backend.predict(&req).await,
            Err(PredictionError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_reads_last_stdout_line() {
        let backend = CommandBackend::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo "loading model for $0"; echo '{"stage":"Consideration","confidence":0.66}'"#
                    .into(),
            ],
        );
        let raw = backend.predict(&request(&["product_view"])).await.unwrap();
        assert_eq!(raw.stage, "Consideration");
        assert!((raw.confidence - 0.66).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_backend_failures() {
        let exit = CommandBackend::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let err = exit.predict(&request(&["page_view"])).await.unwrap_err();
        assert!(matches!(err, PredictionError::ProcessFailed(ref m) if m.contains("boom")));

        let garbage = CommandBackend::new("sh", vec!["-c".into(), "echo not-json".into()]);
        let err = garbage.predict(&request(&["page_view"])).await.unwrap_err();
        assert!(matches!(err, PredictionError::Malformed(_)));

        let missing = CommandBackend::new("/nonexistent/classifier", vec![]);
        let err = missing.predict(&request(&["page_view"])).await.unwrap_err();
        assert!(matches!(err, PredictionError::ProcessFailed(_)));
    }

    #[test]
    fn test_from_config_selects_backend() {
        let mut config = PredictionConfig::default();
        assert_eq!(from_config(&config).unwrap().name(), "disabled");
        config.backend = PredictionBackendKind::Command;
        assert_eq!(from_config(&config).unwrap().name(), "command");
        config.backend = PredictionBackendKind::Rules;
        assert_eq!(from_config(&config).unwrap().name(), "rules");
    }
}
