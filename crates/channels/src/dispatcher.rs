//! Action dispatcher: turns a session's stage into one externally visible
//! action and hands it to the notification channel.
//! Emits `ActionDispatched` or `ActionFailed` events.
//!
//! The dispatcher is stateless. Callers own deduplication.

use std::sync::Arc;

use chrono::Utc;
use journey_core::event_bus::{make_event, EngineEventKind, EventSink};
use journey_core::types::{ActionType, Stage};
use journey_core::{JourneyError, JourneyResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::{DeliveryReceipt, Notification, NotificationChannel};
use crate::templates;

const DEFAULT_RECIPIENT_NAME: &str = "there";

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Sent {
        action: ActionType,
        receipt: DeliveryReceipt,
    },
    /// The stage has no associated action.
    NoAction,
}

impl DispatchOutcome {
    pub fn action(&self) -> Option<ActionType> {
        match self {
            DispatchOutcome::Sent { action, .. } => Some(*action),
            DispatchOutcome::NoAction => None,
        }
    }
}

/// Dispatches stage actions to the configured channel.
pub struct ActionDispatcher {
    channel: Arc<dyn NotificationChannel>,
    event_sink: Arc<dyn EventSink>,
}

impl ActionDispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        info!(channel = channel.name(), "Action dispatcher initialized");
        Self {
            channel,
            event_sink: journey_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting engine events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Dispatch the action for `stage`. Stages without an action are a no-op
    /// and never touch the channel.
    pub async fn dispatch(&self, session_id: &str, stage: Stage) -> JourneyResult<DispatchOutcome> {
        let Some(action) = stage.action() else {
            debug!(session_id = %session_id, stage = %stage, "Stage has no action");
            return Ok(DispatchOutcome::NoAction);
        };

        let content = templates::render(action, DEFAULT_RECIPIENT_NAME);
        let notification = Notification {
            notification_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            stage,
            action,
            subject: content.subject,
            body: content.body,
            created_at: Utc::now(),
        };

        let start = std::time::Instant::now();
        let result = self.channel.send(&notification).await;
        metrics::histogram!(
            "journey.actions.latency_ms",
            "channel" => self.channel.name().to_string()
        )
        .record(start.elapsed().as_millis() as f64);

        match result {
            Ok(receipt) => {
                metrics::counter!(
                    "journey.actions.dispatched",
                    "action" => action.display_name()
                )
                .increment(1);
                self.event_sink.emit(
                    make_event(
                        EngineEventKind::ActionDispatched,
                        Some(session_id),
                        Some(stage),
                        Some(action),
                    )
                    .with_detail(receipt.channel.clone()),
                );
                info!(
                    session_id = %session_id,
                    stage = %stage,
                    action = action.display_name(),
                    "Action dispatched"
                );
                Ok(DispatchOutcome::Sent { action, receipt })
            }
            Err(e) => {
                metrics::counter!(
                    "journey.actions.failed",
                    "action" => action.display_name()
                )
                .increment(1);
                self.event_sink.emit(
                    make_event(
                        EngineEventKind::ActionFailed,
                        Some(session_id),
                        Some(stage),
                        Some(action),
                    )
                    .with_detail(e.to_string()),
                );
                warn!(
                    session_id = %session_id,
                    action = action.display_name(),
                    error = %e,
                    "Action dispatch failed"
                );
                Err(JourneyError::Dispatch(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingChannel;
    use journey_core::event_bus::capture_sink;

    #[tokio::test]
    async fn test_each_actionable_stage_maps_to_one_action() {
        let channel = Arc::new(RecordingChannel::new());
        let dispatcher = ActionDispatcher::new(channel.clone());

        let cases = [
            (Stage::Awareness, ActionType::WelcomeMessage),
            (Stage::Consideration, ActionType::InformationalContent),
            (Stage::Intent, ActionType::IncentiveOffer),
            (Stage::Purchase, ActionType::PurchaseConfirmation),
        ];
        for (stage, expected) in cases {
            let outcome = dispatcher.dispatch("s1", stage).await.unwrap();
            assert_eq!(outcome.action(), Some(expected));
        }

        let sent = channel.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2].subject, "A special offer, just for you");
    }

    #[tokio::test]
    async fn test_unknown_and_decision_are_no_action() {
        let channel = Arc::new(RecordingChannel::new());
        let dispatcher = ActionDispatcher::new(channel.clone());

        for stage in [Stage::Unknown, Stage::Decision] {
            let outcome = dispatcher.dispatch("s1", stage).await.unwrap();
            assert!(matches!(outcome, DispatchOutcome::NoAction));
        }
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test]
    async fn test_channel_failure_surfaces_and_emits() {
        let sink = capture_sink();
        let channel = Arc::new(RecordingChannel::failing());
        let dispatcher = ActionDispatcher::new(channel).with_event_sink(sink.clone());

        let err = dispatcher.dispatch("s1", Stage::Purchase).await.unwrap_err();
        assert!(matches!(err, JourneyError::Dispatch(_)));
        assert_eq!(sink.count_kind(EngineEventKind::ActionFailed), 1);
        assert_eq!(sink.count_kind(EngineEventKind::ActionDispatched), 0);
    }
}
