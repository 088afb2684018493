//! Stage reconciler: recomputes a session's stage from its full event
//! history and persists it through a generation-guarded write.
//!
//! Each reconciliation takes a generation number before it reads anything.
//! Generations come from one strictly increasing counter, so a reconciliation
//! that started later always wins in the store even when it finishes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use journey_core::event_bus::{make_event, noop_sink, EngineEventKind, EventSink};
use journey_core::types::{Stage, StageAnnotation, StageSource};
use journey_core::{AnnotationStore, EventLog, JourneyResult, WriteOutcome};
use tracing::{debug, info};

use crate::classifier::RuleClassifier;
use crate::prediction::{Prediction, PredictionAdapter};

/// Pick the stage to persist: a usable prediction wins, otherwise the rule
/// stage at full confidence (zero when the rules found nothing).
pub fn resolve(rule_stage: Stage, prediction: &Prediction) -> (Stage, f64, StageSource) {
    if prediction.is_usable() {
        (prediction.stage, prediction.confidence, StageSource::Prediction)
    } else {
        (
            rule_stage,
            RuleClassifier::confidence(rule_stage),
            StageSource::Rules,
        )
    }
}

pub struct StageReconciler {
    event_log: Arc<dyn EventLog>,
    store: Arc<dyn AnnotationStore>,
    predictor: Arc<PredictionAdapter>,
    classifier: RuleClassifier,
    /// Next generation to hand out. Starts at 1 so any real annotation
    /// outranks the generation-0 placeholder.
    generation: AtomicU64,
    event_sink: Arc<dyn EventSink>,
}

impl StageReconciler {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        store: Arc<dyn AnnotationStore>,
        predictor: Arc<PredictionAdapter>,
    ) -> Self {
        Self {
            event_log,
            store,
            predictor,
            classifier: RuleClassifier::new(),
            generation: AtomicU64::new(1),
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Recompute and persist the stage for `session_id`.
    ///
    /// Returns the annotation that is current in the store afterwards. When
    /// a newer reconciliation already wrote, that newer annotation is
    /// returned and this one is discarded. A session with no events is
    /// reported `Unknown` and nothing is stored.
    pub async fn reconcile(&self, session_id: &str) -> JourneyResult<StageAnnotation> {
        let generation = self.next_generation();
        let computed_at = Utc::now();

        let events = self.event_log.list_by_session(session_id).await?;
        // Nothing to annotate; the log does not know this session.
        if events.is_empty() {
            debug!(session_id = %session_id, "No events, stage is Unknown");
            return Ok(StageAnnotation::unknown(session_id));
        }

        let rule_stage = self.classifier.classify(&events);
        let prediction = self.predictor.predict(session_id, &events).await;
        let (stage, confidence, source) = resolve(rule_stage, &prediction);

        let anchor = events.last();
        let mut annotation = StageAnnotation {
            session_id: session_id.to_string(),
            stage,
            confidence,
            source,
            computed_at,
            generation,
            anchor_event_id: anchor.map(|e| e.id),
            anchor_timestamp: anchor.map(|e| e.timestamp),
            prediction_error: prediction.error,
        };

        match self.store.compare_and_set(annotation.clone()).await? {
            WriteOutcome::Applied { previous } => {
                metrics::counter!("journey.annotations.written").increment(1);
                if let Some(previous) = &previous {
                    annotation.computed_at = annotation.computed_at.max(previous.computed_at);
                }
                let previous_stage = previous.map(|p| p.stage);
                if previous_stage != Some(stage) {
                    info!(
                        session_id = %session_id,
                        from = previous_stage.map(|s| s.as_str()).unwrap_or("none"),
                        to = %stage,
                        confidence,
                        generation,
                        "Stage changed"
                    );
                    metrics::counter!("journey.stage.transitions", "to" => stage.as_str())
                        .increment(1);
                    let detail = previous_stage
                        .map(|s| s.as_str())
                        .unwrap_or("none")
                        .to_string();
                    self.event_sink.emit(
                        make_event(
                            EngineEventKind::StageChanged,
                            Some(session_id),
                            Some(stage),
                            None,
                        )
                        .with_detail(detail),
                    );
                }
                Ok(annotation)
            }
            WriteOutcome::Stale { current } => {
                metrics::counter!("journey.annotations.stale_discarded").increment(1);
                debug!(
                    session_id = %session_id,
                    generation,
                    current_generation = current.generation,
                    "Discarded stale annotation"
                );
                Ok(current)
            }
        }
    }
}
