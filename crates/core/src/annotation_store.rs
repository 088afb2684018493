//! Storage for the current stage annotation of every session.
//!
//! Writes are conditional on the annotation `generation`: a reconciliation
//! that started earlier can never replace the result of one that started
//! later, whatever order they finish in. An applied write never moves a
//! session's `computed_at` backwards.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::error::{JourneyError, JourneyResult};
use crate::types::StageAnnotation;

/// Result of a conditional annotation write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied {
        previous: Option<StageAnnotation>,
    },
    /// The stored annotation came from a later computation and was kept.
    Stale {
        current: StageAnnotation,
    },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }
}

#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Store `annotation` unless the current one has a higher generation.
    /// The stored `computed_at` is clamped so it never decreases.
    async fn compare_and_set(&self, annotation: StageAnnotation) -> JourneyResult<WriteOutcome>;

    async fn get(&self, session_id: &str) -> JourneyResult<Option<StageAnnotation>>;

    /// Current annotation of every session.
    async fn all(&self) -> JourneyResult<Vec<StageAnnotation>>;

    /// Accepted annotations that changed the session's stage, oldest first.
    async fn history(&self, session_id: &str) -> JourneyResult<Vec<StageAnnotation>>;

    /// Stage-change histories of every session.
    async fn all_histories(&self) -> JourneyResult<Vec<Vec<StageAnnotation>>>;
}

struct SessionRecord {
    current: StageAnnotation,
    history: VecDeque<StageAnnotation>,
}

/// Annotation store backed by a sharded concurrent map. The compare and the
/// set happen under the same shard lock.
pub struct InMemoryAnnotationStore {
    records: DashMap<String, SessionRecord>,
    history_limit: usize,
}

impl InMemoryAnnotationStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            records: DashMap::new(),
            history_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn push_history(&self, history: &mut VecDeque<StageAnnotation>, annotation: StageAnnotation) {
        if self.history_limit == 0 {
            return;
        }
        history.push_back(annotation);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

impl Default for InMemoryAnnotationStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl AnnotationStore for InMemoryAnnotationStore {
    async fn compare_and_set(&self, mut annotation: StageAnnotation) -> JourneyResult<WriteOutcome> {
        match self.records.entry(annotation.session_id.clone()) {
            Entry::Vacant(vacant) => {
                let mut history = VecDeque::new();
                self.push_history(&mut history, annotation.clone());
                vacant.insert(SessionRecord {
                    current: annotation,
                    history,
                });
                Ok(WriteOutcome::Applied { previous: None })
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.current.generation > annotation.generation {
                    debug!(
                        session_id = %annotation.session_id,
                        stored = record.current.generation,
                        rejected = annotation.generation,
                        "Discarding stale annotation"
                    );
                    return Ok(WriteOutcome::Stale {
                        current: record.current.clone(),
                    });
                }
                annotation.computed_at = annotation.computed_at.max(record.current.computed_at);
                let previous = std::mem::replace(&mut record.current, annotation.clone());
                if previous.stage != annotation.stage {
                    self.push_history(&mut record.history, annotation);
                }
                Ok(WriteOutcome::Applied {
                    previous: Some(previous),
                })
            }
        }
    }

    async fn get(&self, session_id: &str) -> JourneyResult<Option<StageAnnotation>> {
        Ok(self.records.get(session_id).map(|r| r.current.clone()))
    }

    async fn all(&self) -> JourneyResult<Vec<StageAnnotation>> {
        Ok(self
            .records
            .iter()
            .map(|entry| entry.value().current.clone())
            .collect())
    }

    async fn history(&self, session_id: &str) -> JourneyResult<Vec<StageAnnotation>> {
        Ok(self
            .records
            .get(session_id)
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn all_histories(&self) -> JourneyResult<Vec<Vec<StageAnnotation>>> {
        Ok(self
            .records
            .iter()
            .map(|entry| entry.value().history.iter().cloned().collect())
            .collect())
    }
}

/// Annotation store whose writes fail for chosen sessions. Reads and all
/// other sessions go to an in-memory store.
#[derive(Default)]
pub struct FailingAnnotationStore {
    inner: InMemoryAnnotationStore,
    failing: DashSet<String>,
}

impl FailingAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write to `session_id` fails from now on.
    pub fn fail_writes_for(&self, session_id: &str) {
        self.failing.insert(session_id.to_string());
    }

}

#[async_trait]
impl AnnotationStore for FailingAnnotationStore {
    async fn compare_and_set(&self, annotation: StageAnnotation) -> JourneyResult<WriteOutcome> {
        if self.failing.contains(&annotation.session_id) {
            return Err(JourneyError::AnnotationStore(format!(
                "write refused for session {}",
                annotation.session_id
            )));
        }
        self.inner.compare_and_set(annotation).await
    }

    async fn get(&self, session_id: &str) -> JourneyResult<Option<StageAnnotation>> {
        self.inner.get(session_id).await
    }

    async fn all(&self) -> JourneyResult<Vec<StageAnnotation>> {
        self.inner.all().await
    }

    async fn history(&self, session_id: &str) -> JourneyResult<Vec<StageAnnotation>> {
        self.inner.history(session_id).await
    }

    async fn all_histories(&self) -> JourneyResult<Vec<Vec<StageAnnotation>>> {
        self.inner.all_histories().await
    }
}
