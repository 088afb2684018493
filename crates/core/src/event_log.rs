//! Event log collaborator: append-only, per-session, timestamp-ordered.
//!
//! The engine only needs the narrow contract in [`EventLog`]; the in-memory
//! implementation backs tests, the demo binary, and single-node deployments.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{JourneyError, JourneyResult};
use crate::types::{Event, NewEvent};

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event; a missing timestamp means "now".
    async fn append(&self, event: NewEvent) -> JourneyResult<Event>;

    /// All events for a session in timestamp order, ties by insertion order.
    async fn list_by_session(&self, session_id: &str) -> JourneyResult<Vec<Event>>;

    /// The newest `limit` events for a session, newest first.
    async fn list_recent(&self, session_id: &str, limit: usize) -> JourneyResult<Vec<Event>> {
        let mut events = self.list_by_session(session_id).await?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn list_distinct_session_ids(&self) -> JourneyResult<BTreeSet<String>>;
}

/// Event log held in process memory.
#[derive(Default)]
pub struct InMemoryEventLog {
    sessions: RwLock<HashMap<String, Vec<Event>>>,
    sequence: AtomicU64,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn event_count(&self) -> usize {
        self.sessions.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: NewEvent) -> JourneyResult<Event> {
        if event.session_id.trim().is_empty() {
            return Err(JourneyError::Validation("session_id is required".into()));
        }

        let stored = Event {
            id: Uuid::new_v4(),
            session_id: event.session_id,
            event_name: event.event_name,
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            metadata: event.metadata,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };

        let mut sessions = self.sessions.write();
        let events = sessions.entry(stored.session_id.clone()).or_default();
        // Insert after every event with an equal or earlier timestamp.
        let position = events.partition_point(|e| e.timestamp <= stored.timestamp);
        events.insert(position, stored.clone());

        debug!(
            session_id = %stored.session_id,
            event = %stored.event_name,
            sequence = stored.sequence,
            "Event appended"
        );

        Ok(stored)
    }

    async fn list_by_session(&self, session_id: &str) -> JourneyResult<Vec<Event>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_distinct_session_ids(&self) -> JourneyResult<BTreeSet<String>> {
        Ok(self.sessions.read().keys().cloned().collect())
    }
}

/// Event log that refuses to enumerate sessions while `set_listing_fails`
/// is on. Everything else goes to an in-memory log.
#[derive(Default)]
pub struct FailingEventLog {
    inner: InMemoryEventLog,
    listing_fails: AtomicBool,
}

impl FailingEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listing_fails(&self, fails: bool) {
        self.listing_fails.store(fails, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.inner.event_count()
    }
}

#[async_trait]
impl EventLog for FailingEventLog {
    async fn append(&self, event: NewEvent) -> JourneyResult<Event> {
        self.inner.append(event).await
    }

    async fn list_by_session(&self, session_id: &str) -> JourneyResult<Vec<Event>> {
        self.inner.list_by_session(session_id).await
    }

    async fn list_distinct_session_ids(&self) -> JourneyResult<BTreeSet<String>> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(JourneyError::EventLog("session listing unavailable".into()));
        }
        self.inner.list_distinct_session_ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventName;
    use chrono::Duration;

    #[tokio::test]
    async fn test_append_orders_by_timestamp_then_insertion() {
        let log = InMemoryEventLog::new();
        let base = Utc::now();

        log.append(NewEvent::new("s1", "product_view").at(base))
            .await
            .unwrap();
        log.append(NewEvent::new("s1", "page_view").at(base - Duration::seconds(10)))
            .await
            .unwrap();
        log.append(NewEvent::new("s1", "cta_click").at(base))
            .await
            .unwrap();

        let events = log.list_by_session("s1").await.unwrap();
        let names: Vec<_> = events.iter().map(|e| e.event_name.clone()).collect();
        assert_eq!(
            names,
            vec![EventName::PageView, EventName::ProductView, EventName::CtaClick]
        );
    }

    #[tokio::test]
    async fn test_list_recent_is_newest_first() {
        let log = InMemoryEventLog::new();
        let base = Utc::now();
        for (i, name) in ["page_view", "product_view", "add_to_cart"].iter().enumerate() {
            log.append(NewEvent::new("s1", *name).at(base + Duration::seconds(i as i64)))
                .await
                .unwrap();
        }

        let recent = log.list_recent("s1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_name, EventName::AddToCart);
        assert_eq!(recent[1].event_name, EventName::ProductView);
    }

    #[tokio::test]
    async fn test_distinct_sessions_and_empty_session() {
        let log = InMemoryEventLog::new();
        log.append(NewEvent::new("a", "page_view")).await.unwrap();
        log.append(NewEvent::new("b", "page_view")).await.unwrap();
        log.append(NewEvent::new("a", "purchase")).await.unwrap();

        let ids = log.list_distinct_session_ids().await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(log.event_count(), 3);
        assert!(log.list_by_session("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_session_rejected() {
        let log = InMemoryEventLog::new();
        let err = log.append(NewEvent::new("  ", "page_view")).await.unwrap_err();
        assert!(matches!(err, JourneyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failing_log_only_breaks_listing() {
        let log = FailingEventLog::new();
        log.append(NewEvent::new("a", "page_view")).await.unwrap();
        log.set_listing_fails(true);

        let err = log.list_distinct_session_ids().await.unwrap_err();
        assert!(matches!(err, JourneyError::EventLog(_)));
        assert_eq!(log.list_by_session("a").await.unwrap().len(), 1);

        log.set_listing_fails(false);
        assert_eq!(log.list_distinct_session_ids().await.unwrap().len(), 1);
    }
}
