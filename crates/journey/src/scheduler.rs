//! Automation scheduler: periodic sweeps that reconcile every known session
//! and dispatch at most one action per session per stage change.
//!
//! Sweeps never overlap: a tick that fires while a sweep is still running is
//! skipped. Within a sweep sessions are processed with bounded concurrency.
//! A session's window record is only written after a successful dispatch, so
//! a failed send is retried on the next sweep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use journey_channels::{ActionDispatcher, DispatchOutcome};
use journey_core::config::SchedulerConfig;
use journey_core::event_bus::{make_event, noop_sink, EngineEventKind, EventSink};
use journey_core::types::{ActionWindowRecord, Stage};
use journey_core::{EventLog, JourneyError, JourneyResult};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconciler::StageReconciler;

/// Totals for one completed sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub window_id: u64,
    pub sessions: usize,
    pub dispatched: usize,
    /// Sessions whose stage was already actioned or has no action.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was still in flight.
    Skipped,
    /// Sessions could not be listed; nothing was processed.
    Failed(String),
}

enum SessionResult {
    Dispatched,
    Skipped,
    Failed,
}

/// Clears the in-flight flag when a sweep ends, including on cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SweepState {
    event_log: Arc<dyn EventLog>,
    reconciler: Arc<StageReconciler>,
    dispatcher: Arc<ActionDispatcher>,
    windows: DashMap<String, ActionWindowRecord>,
    in_flight: AtomicBool,
    sweeps: AtomicU64,
    concurrency: usize,
    rearm_after_sweeps: u64,
    event_sink: Arc<dyn EventSink>,
}

impl SweepState {
    async fn run_sweep(&self) -> SweepOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            metrics::counter!("journey.sweeps.skipped").increment(1);
            debug!("Sweep still in flight, skipping tick");
            return SweepOutcome::Skipped;
        };

        let window_id = self.sweeps.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();

        let sessions = match self.event_log.list_distinct_session_ids().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(window_id, error = %e, "Sweep could not list sessions");
                return SweepOutcome::Failed(e.to_string());
            }
        };

        let session_count = sessions.len();
        let results: Vec<SessionResult> = stream::iter(sessions)
            .map(|session_id| async move { self.process_session(&session_id, window_id).await })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport {
            window_id,
            sessions: session_count,
            ..Default::default()
        };
        for result in results {
            match result {
                SessionResult::Dispatched => report.dispatched += 1,
                SessionResult::Skipped => report.skipped += 1,
                SessionResult::Failed => report.failed += 1,
            }
        }

        metrics::counter!("journey.sweeps.completed").increment(1);
        metrics::histogram!("journey.sweeps.duration_ms").record(start.elapsed().as_millis() as f64);
        self.event_sink.emit(
            make_event(EngineEventKind::SweepCompleted, None, None, None).with_detail(format!(
                "window={} sessions={} dispatched={} failed={}",
                window_id, report.sessions, report.dispatched, report.failed
            )),
        );
        info!(
            window_id,
            sessions = report.sessions,
            dispatched = report.dispatched,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep completed"
        );
        SweepOutcome::Completed(report)
    }

    async fn process_session(&self, session_id: &str, window_id: u64) -> SessionResult {
        let annotation = match self.reconciler.reconcile(session_id).await {
            Ok(annotation) => annotation,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Reconciliation failed during sweep");
                return SessionResult::Failed;
            }
        };

        let stage = annotation.stage;
        if stage.action().is_none() || !self.is_due(session_id, stage, window_id) {
            return SessionResult::Skipped;
        }

        match self.dispatcher.dispatch(session_id, stage).await {
            Ok(DispatchOutcome::Sent { .. }) => {
                self.record(session_id, stage, window_id);
                SessionResult::Dispatched
            }
            Ok(DispatchOutcome::NoAction) => SessionResult::Skipped,
            // Record left untouched so the next sweep retries.
            Err(_) => SessionResult::Failed,
        }
    }

    fn is_due(&self, session_id: &str, stage: Stage, window_id: u64) -> bool {
        match self.windows.get(session_id) {
            None => true,
            Some(record) if record.stage != stage => true,
            Some(record) => {
                self.rearm_after_sweeps > 0
                    && window_id >= record.window_id + self.rearm_after_sweeps
            }
        }
    }

    fn record(&self, session_id: &str, stage: Stage, window_id: u64) {
        self.windows.insert(
            session_id.to_string(),
            ActionWindowRecord {
                session_id: session_id.to_string(),
                stage,
                window_id,
            },
        );
    }
}

pub struct AutomationScheduler {
    state: Arc<SweepState>,
    interval: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AutomationScheduler {
    pub fn new(
        config: &SchedulerConfig,
        event_log: Arc<dyn EventLog>,
        reconciler: Arc<StageReconciler>,
        dispatcher: Arc<ActionDispatcher>,
    ) -> Self {
        Self {
            state: Arc::new(SweepState {
                event_log,
                reconciler,
                dispatcher,
                windows: DashMap::new(),
                in_flight: AtomicBool::new(false),
                sweeps: AtomicU64::new(0),
                concurrency: config.concurrency,
                rearm_after_sweeps: config.rearm_after_sweeps,
                event_sink: noop_sink(),
            }),
            interval: Duration::from_secs(config.interval_secs),
            running: Mutex::new(None),
        }
    }

    /// Attach an event sink. Must be called before `start`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.event_sink = sink;
        }
        self
    }

    /// Spawn the periodic sweep loop on the current runtime. The first sweep
    /// runs one interval after start.
    pub fn start(&self) -> JourneyResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(JourneyError::Scheduler("scheduler already running".into()));
        }

        let token = CancellationToken::new();
        let state = self.state.clone();
        let period = self.interval;
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = child.cancelled() => break,
                            _ = state.run_sweep() => {}
                        }
                    }
                }
            }
            debug!("Sweep loop exited");
        });

        info!(interval_secs = period.as_secs(), "Automation scheduler started");
        *running = Some((token, handle));
        Ok(())
    }

    /// Cancel the loop and wait for it to exit. A sweep in progress is
    /// abandoned; no partial state is persisted beyond completed sessions.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.running.lock().take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Sweep loop ended abnormally");
        }
        info!("Automation scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run one sweep now, outside the timer.
    pub async fn run_sweep(&self) -> SweepOutcome {
        self.state.run_sweep().await
    }

    /// Dispatch the action for `stage` regardless of the window record, then
    /// record it so the next sweep does not repeat it.
    pub async fn trigger(&self, session_id: &str, stage: Stage) -> JourneyResult<DispatchOutcome> {
        let outcome = self.state.dispatcher.dispatch(session_id, stage).await?;
        if let DispatchOutcome::Sent { .. } = outcome {
            let window_id = self.state.sweeps.load(Ordering::SeqCst);
            self.state.record(session_id, stage, window_id);
        }
        Ok(outcome)
    }

    pub fn window(&self, session_id: &str) -> Option<ActionWindowRecord> {
        self.state.windows.get(session_id).map(|r| r.value().clone())
    }

    pub fn sweeps_run(&self) -> u64 {
        self.state.sweeps.load(Ordering::SeqCst)
    }
}
