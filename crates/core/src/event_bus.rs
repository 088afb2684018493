//! Engine event bus: trait for emitting engine events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` to publish what happened
//! (stage changes, degraded predictions, dispatched actions, sweeps) to
//! whatever observes the engine.

use crate::types::{ActionType, Stage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventKind {
    EventIngested,
    StageChanged,
    PredictionDegraded,
    ActionDispatched,
    ActionFailed,
    SweepCompleted,
}

/// Something observable the engine did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub kind: EngineEventKind,
    pub session_id: Option<String>,
    pub stage: Option<Stage>,
    pub action: Option<ActionType>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: EngineEventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating an `EngineEvent` with minimal boilerplate.
pub fn make_event(
    kind: EngineEventKind,
    session_id: Option<&str>,
    stage: Option<Stage>,
    action: Option<ActionType>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        kind,
        session_id: session_id.map(str::to_string),
        stage,
        action,
        detail: None,
        timestamp: Utc::now(),
    }
}

impl EngineEvent {
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience: create a no-op event bus for components that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            EngineEventKind::StageChanged,
            Some("s1"),
            Some(Stage::Intent),
            None,
        ));
        sink.emit(
            make_event(
                EngineEventKind::ActionDispatched,
                Some("s1"),
                Some(Stage::Intent),
                Some(ActionType::IncentiveOffer),
            )
            .with_detail("log"),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_kind(EngineEventKind::StageChanged), 1);
        assert_eq!(sink.count_kind(EngineEventKind::ActionDispatched), 1);

        let events = sink.events();
        assert_eq!(events[0].session_id.as_deref(), Some("s1"));
        assert_eq!(events[1].action, Some(ActionType::IncentiveOffer));
        assert_eq!(events[1].detail.as_deref(), Some("log"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EngineEventKind::SweepCompleted, None, None, None));
    }
}
