//! Journey stage engine facade and its builder: wires the event log,
//! annotation store, prediction adapter, reconciler, scheduler and analytics
//! behind the calls a transport layer makes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use journey_analytics::AnalyticsAggregator;
use journey_channels::{
    ActionDispatcher, DispatchOutcome, LogChannel, NotificationChannel, WebhookChannel,
};
use journey_core::config::{AppConfig, NotificationChannelKind, PredictionConfig, SchedulerConfig};
use journey_core::event_bus::{make_event, noop_sink, EngineEventKind, EventSink};
use journey_core::types::{
    AnalyticsFilter, Event, Metadata, NewEvent, Stage, StageAnnotation, StageCount, StageDwell,
    StageTransition,
};
use journey_core::{
    AnnotationStore, EventLog, InMemoryAnnotationStore, InMemoryEventLog, JourneyError,
    JourneyResult,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::backends::{self, DisabledBackend};
use crate::prediction::{PredictionAdapter, PredictionBackend};
use crate::reconciler::StageReconciler;
use crate::scheduler::{AutomationScheduler, SweepOutcome};

/// Result of accepting one event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub event: Event,
    /// Current annotation after the triggered reconciliation. `None` only
    /// when reconciliation failed and nothing was stored before.
    pub annotation: Option<StageAnnotation>,
}

/// Entry point for callers: ingestion, stage queries, analytics and action
/// automation over one event log and annotation store.
pub struct JourneyStageEngine {
    event_log: Arc<dyn EventLog>,
    store: Arc<dyn AnnotationStore>,
    reconciler: Arc<StageReconciler>,
    scheduler: AutomationScheduler,
    analytics: AnalyticsAggregator,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JourneyStageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyStageEngine")
            .field("scheduler_running", &self.scheduler.is_running())
            .field("sweeps_run", &self.scheduler.sweeps_run())
            .finish()
    }
}

impl JourneyStageEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Wire an engine from configuration with in-memory storage.
    pub fn from_config(config: &AppConfig) -> JourneyResult<Self> {
        config.validate()?;
        let channel: Arc<dyn NotificationChannel> = match config.notifications.channel {
            NotificationChannelKind::Log => Arc::new(LogChannel),
            NotificationChannelKind::Webhook => {
                let url = config.notifications.webhook_url.clone().ok_or_else(|| {
                    JourneyError::Config("webhook channel requires webhook_url".into())
                })?;
                let timeout = Duration::from_millis(config.notifications.timeout_ms);
                Arc::new(
                    WebhookChannel::new(url, timeout)
                        .map_err(|e| JourneyError::Config(e.to_string()))?,
                )
            }
        };

        Ok(EngineBuilder::default()
            .prediction(config.prediction.clone())
            .backend(backends::from_config(&config.prediction)?)
            .scheduler(config.scheduler.clone())
            .history_limit(config.store.history_limit)
            .channel(channel)
            .build())
    }

    /// Accept an event stamped now and reconcile its session.
    pub async fn ingest(
        &self,
        session_id: &str,
        event_name: &str,
        metadata: Metadata,
    ) -> JourneyResult<IngestOutcome> {
        self.ingest_event(NewEvent::new(session_id, event_name).with_metadata(metadata))
            .await
    }

    /// Accept an event, possibly carrying its own timestamp.
    ///
    /// The event is stored even if reconciliation then fails; the failure is
    /// logged and the previous annotation, if any, is returned.
    pub async fn ingest_event(&self, event: NewEvent) -> JourneyResult<IngestOutcome> {
        if event.session_id.trim().is_empty() {
            return Err(JourneyError::Validation("session_id must not be empty".into()));
        }
        if event.event_name.as_str().trim().is_empty() {
            return Err(JourneyError::Validation("event_name must not be empty".into()));
        }

        let event = self.event_log.append(event).await?;
        metrics::counter!("journey.events.ingested", "event" => event.event_name.as_str().to_string())
            .increment(1);
        self.event_sink.emit(
            make_event(EngineEventKind::EventIngested, Some(&event.session_id), None, None)
                .with_detail(event.event_name.as_str()),
        );

        let annotation = match self.reconciler.reconcile(&event.session_id).await {
            Ok(annotation) => Some(annotation),
            Err(e) => {
                warn!(session_id = %event.session_id, error = %e, "Reconciliation after ingest failed");
                self.store.get(&event.session_id).await.unwrap_or(None)
            }
        };
        Ok(IngestOutcome { event, annotation })
    }

    /// Current stage for a session. Sessions with events but no stored
    /// annotation are reconciled on demand; sessions with no events are
    /// reported `Unknown` at zero confidence.
    pub async fn get_stage(&self, session_id: &str) -> JourneyResult<StageAnnotation> {
        if let Some(annotation) = self.store.get(session_id).await? {
            return Ok(annotation);
        }
        if self.event_log.list_recent(session_id, 1).await?.is_empty() {
            return Ok(StageAnnotation::unknown(session_id));
        }
        self.reconciler.reconcile(session_id).await
    }

    /// Recompute a session's stage now.
    pub async fn reconcile(&self, session_id: &str) -> JourneyResult<StageAnnotation> {
        self.reconciler.reconcile(session_id).await
    }

    pub async fn get_stage_history(&self, session_id: &str) -> JourneyResult<Vec<StageAnnotation>> {
        self.store.history(session_id).await
    }

    /// Most recent events for a session, newest first.
    pub async fn get_events(&self, session_id: &str, limit: usize) -> JourneyResult<Vec<Event>> {
        self.event_log.list_recent(session_id, limit).await
    }

    pub async fn get_analytics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> JourneyResult<Vec<StageCount>> {
        self.analytics.aggregate(Some(AnalyticsFilter { from, to })).await
    }

    pub async fn get_transitions(
        &self,
        filter: Option<AnalyticsFilter>,
    ) -> JourneyResult<Vec<StageTransition>> {
        self.analytics.transitions(filter).await
    }

    pub async fn get_time_in_stage(
        &self,
        filter: Option<AnalyticsFilter>,
    ) -> JourneyResult<Vec<StageDwell>> {
        self.analytics.time_in_stage(filter).await
    }

    /// Send the action for `stage` now, bypassing deduplication.
    pub async fn trigger_action(
        &self,
        session_id: &str,
        stage: Stage,
    ) -> JourneyResult<DispatchOutcome> {
        if session_id.trim().is_empty() {
            return Err(JourneyError::Validation("session_id must not be empty".into()));
        }
        self.scheduler.trigger(session_id, stage).await
    }

    pub fn start_automation(&self) -> JourneyResult<()> {
        self.scheduler.start()
    }

    pub async fn stop_automation(&self) {
        self.scheduler.stop().await
    }

    pub async fn run_sweep(&self) -> SweepOutcome {
        self.scheduler.run_sweep().await
    }

    pub fn scheduler(&self) -> &AutomationScheduler {
        &self.scheduler
    }

    /// Load a few sample sessions walking down the funnel.
    pub async fn seed_demo(&self) -> JourneyResult<usize> {
        info!("Seeding demo sessions");
        let sessions: [(&str, &[&str]); 4] = [
            ("demo-awareness", &["page_view"]),
            ("demo-consideration", &["page_view", "product_view"]),
            ("demo-intent", &["page_view", "product_view", "add_to_cart"]),
            ("demo-purchase", &["page_view", "product_view", "add_to_cart", "purchase"]),
        ];
        let start = Utc::now() - chrono::Duration::minutes(30);
        let mut seeded = 0;
        for (session_id, names) in sessions {
            for (i, name) in names.iter().enumerate() {
                let at = start + chrono::Duration::minutes(5 * i as i64);
                self.ingest_event(NewEvent::new(session_id, *name).at(at)).await?;
                seeded += 1;
            }
        }
        info!(events = seeded, "Seeded demo sessions");
        Ok(seeded)
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Assembles an engine; every part defaults to its in-memory or rules-only
/// form.
pub struct EngineBuilder {
    event_log: Option<Arc<dyn EventLog>>,
    store: Option<Arc<dyn AnnotationStore>>,
    backend: Arc<dyn PredictionBackend>,
    channel: Arc<dyn NotificationChannel>,
    prediction: PredictionConfig,
    scheduler: SchedulerConfig,
    history_limit: usize,
    event_sink: Arc<dyn EventSink>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            event_log: None,
            store: None,
            backend: Arc::new(DisabledBackend),
            channel: Arc::new(LogChannel),
            prediction: PredictionConfig::default(),
            scheduler: SchedulerConfig::default(),
            history_limit: 100,
            event_sink: noop_sink(),
        }
    }
}

impl EngineBuilder {
    pub fn event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn store(mut self, store: Arc<dyn AnnotationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn PredictionBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channel = channel;
        self
    }

    /// Timeout and event window for prediction calls.
    pub fn prediction(mut self, config: PredictionConfig) -> Self {
        self.prediction = config;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn build(self) -> JourneyStageEngine {
        let event_log = self
            .event_log
            .unwrap_or_else(|| Arc::new(InMemoryEventLog::new()) as Arc<dyn EventLog>);
        let store = self
            .store
            .unwrap_or_else(|| {
                Arc::new(InMemoryAnnotationStore::new(self.history_limit)) as Arc<dyn AnnotationStore>
            });

        let predictor = Arc::new(
            PredictionAdapter::new(
                self.backend,
                Duration::from_millis(self.prediction.timeout_ms),
                self.prediction.max_events,
            )
            .with_event_sink(self.event_sink.clone()),
        );
        let reconciler = Arc::new(
            StageReconciler::new(event_log.clone(), store.clone(), predictor)
                .with_event_sink(self.event_sink.clone()),
        );
        let dispatcher =
            Arc::new(ActionDispatcher::new(self.channel).with_event_sink(self.event_sink.clone()));
        let scheduler =
            AutomationScheduler::new(&self.scheduler, event_log.clone(), reconciler.clone(), dispatcher)
                .with_event_sink(self.event_sink.clone());

        info!(
            prediction_timeout_ms = self.prediction.timeout_ms,
            sweep_interval_secs = self.scheduler.interval_secs,
            sweep_concurrency = self.scheduler.concurrency,
            "Journey stage engine initialized"
        );

        JourneyStageEngine {
            analytics: AnalyticsAggregator::new(store.clone()),
            event_log,
            store,
            reconciler,
            scheduler,
            event_sink: self.event_sink,
        }
    }
}
