//! Stage rollups for reporting: how many sessions sit in each stage, how
//! sessions move between stages, and how long they stay.
//!
//! Everything here reads the annotation store and never writes to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use journey_core::types::{AnalyticsFilter, StageAnnotation, StageCount, StageDwell, StageTransition};
use journey_core::{AnnotationStore, JourneyResult};
use tracing::debug;

const MS_PER_HOUR: f64 = 3_600_000.0;

pub struct AnalyticsAggregator {
    store: Arc<dyn AnnotationStore>,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn AnnotationStore>) -> Self {
        Self { store }
    }

    /// Count and average confidence of current annotations per stage.
    pub async fn aggregate(&self, filter: Option<AnalyticsFilter>) -> JourneyResult<Vec<StageCount>> {
        let annotations = self.store.all().await?;
        let rows = stage_counts(&annotations, &filter.unwrap_or_default());
        debug!(sessions = annotations.len(), stages = rows.len(), "Stage rollup computed");
        metrics::counter!("journey.analytics.queries", "report" => "stages").increment(1);
        Ok(rows)
    }

    /// Stage-to-stage moves observed in session histories.
    pub async fn transitions(
        &self,
        filter: Option<AnalyticsFilter>,
    ) -> JourneyResult<Vec<StageTransition>> {
        let histories = self.store.all_histories().await?;
        metrics::counter!("journey.analytics.queries", "report" => "transitions").increment(1);
        Ok(stage_transitions(&histories, &filter.unwrap_or_default()))
    }

    /// Average hours spent in a stage before moving on.
    pub async fn time_in_stage(
        &self,
        filter: Option<AnalyticsFilter>,
    ) -> JourneyResult<Vec<StageDwell>> {
        let histories = self.store.all_histories().await?;
        metrics::counter!("journey.analytics.queries", "report" => "dwell").increment(1);
        Ok(stage_dwell(&histories, &filter.unwrap_or_default()))
    }
}

pub fn stage_counts(annotations: &[StageAnnotation], filter: &AnalyticsFilter) -> Vec<StageCount> {
    let mut groups: BTreeMap<_, (u64, f64)> = BTreeMap::new();
    for annotation in annotations
        .iter()
        .filter(|a| filter.matches(a.anchor_timestamp))
    {
        let entry = groups.entry(annotation.stage).or_default();
        entry.0 += 1;
        entry.1 += annotation.confidence;
    }

    groups
        .into_iter()
        .map(|(stage, (count, total))| StageCount {
            stage,
            count,
            avg_confidence: total / count as f64,
        })
        .collect()
}

pub fn stage_transitions(
    histories: &[Vec<StageAnnotation>],
    filter: &AnalyticsFilter,
) -> Vec<StageTransition> {
    let mut counts: BTreeMap<_, u64> = BTreeMap::new();
    for history in histories {
        for pair in history.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if from.stage == to.stage || !filter.matches(to.anchor_timestamp) {
                continue;
            }
            *counts.entry((from.stage, to.stage)).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .map(|((from, to), count)| StageTransition { from, to, count })
        .collect()
}

pub fn stage_dwell(histories: &[Vec<StageAnnotation>], filter: &AnalyticsFilter) -> Vec<StageDwell> {
    let mut totals: BTreeMap<_, (u64, f64)> = BTreeMap::new();
    for history in histories {
        for pair in history.windows(2) {
            let (entered, left) = (&pair[0], &pair[1]);
            if !filter.matches(entered.anchor_timestamp) {
                continue;
            }
            let millis = (left.computed_at - entered.computed_at).num_milliseconds().max(0);
            let entry = totals.entry(entered.stage).or_default();
            entry.0 += 1;
            entry.1 += millis as f64 / MS_PER_HOUR;
        }
    }

    totals
        .into_iter()
        .map(|(stage, (samples, hours))| StageDwell {
            stage,
            avg_hours: hours / samples as f64,
            samples,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use journey_core::types::{Stage, StageSource};
    use journey_core::InMemoryAnnotationStore;

    fn annotation(
        session: &str,
        stage: Stage,
        confidence: f64,
        generation: u64,
        at: DateTime<Utc>,
    ) -> StageAnnotation {
        StageAnnotation {
            session_id: session.to_string(),
            stage,
            confidence,
            source: StageSource::Prediction,
            computed_at: at,
            generation,
            anchor_event_id: None,
            anchor_timestamp: Some(at),
            prediction_error: None,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_rollup_counts_and_averages() {
        let store = Arc::new(InMemoryAnnotationStore::new(10));
        let now = Utc::now();
        for (session, stage, confidence) in [
            ("a", Stage::Awareness, 0.5),
            ("b", Stage::Awareness, 0.7),
            ("c", Stage::Purchase, 0.9),
        ] {
            store
                .compare_and_set(annotation(session, stage, confidence, 1, now))
                .await
                .unwrap();
        }

        let aggregator = AnalyticsAggregator::new(store);
        let rows = aggregator.aggregate(None).await.unwrap();

        assert_eq!(rows.len(), 2);
        let awareness = rows.iter().find(|r| r.stage == Stage::Awareness).unwrap();
        assert_eq!(awareness.count, 2);
        assert!(approx(awareness.avg_confidence, 0.6));
        let purchase = rows.iter().find(|r| r.stage == Stage::Purchase).unwrap();
        assert_eq!(purchase.count, 1);
        assert!(approx(purchase.avg_confidence, 0.9));
    }

    #[tokio::test]
    async fn test_empty_store_yields_no_rows() {
        let store = Arc::new(InMemoryAnnotationStore::new(10));
        let aggregator = AnalyticsAggregator::new(store);
        assert!(aggregator.aggregate(None).await.unwrap().is_empty());
        assert!(aggregator.transitions(None).await.unwrap().is_empty());
        assert!(aggregator.time_in_stage(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_zero_confidence_and_time_filter() {
        let now = Utc::now();
        let annotations = vec![
            annotation("a", Stage::Unknown, 0.0, 1, now),
            annotation("b", Stage::Unknown, 0.0, 1, now - Duration::days(3)),
        ];

        let all = stage_counts(&annotations, &AnalyticsFilter::default());
        assert_eq!(all, vec![StageCount { stage: Stage::Unknown, count: 2, avg_confidence: 0.0 }]);

        let recent = stage_counts(
            &annotations,
            &AnalyticsFilter::between(now - Duration::hours(1), now + Duration::hours(1)),
        );
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].count, 1);
    }

    #[test]
    fn test_transitions_and_dwell_from_histories() {
        let t0 = Utc::now() - Duration::hours(10);
        let histories = vec![
            vec![
                annotation("a", Stage::Awareness, 1.0, 1, t0),
                annotation("a", Stage::Intent, 1.0, 2, t0 + Duration::hours(2)),
                annotation("a", Stage::Purchase, 1.0, 3, t0 + Duration::hours(3)),
            ],
            vec![
                annotation("b", Stage::Awareness, 1.0, 4, t0),
                annotation("b", Stage::Intent, 1.0, 5, t0 + Duration::hours(4)),
            ],
        ];
        let filter = AnalyticsFilter::default();

        let transitions = stage_transitions(&histories, &filter);
        assert_eq!(
            transitions,
            vec![
                StageTransition { from: Stage::Awareness, to: Stage::Intent, count: 2 },
                StageTransition { from: Stage::Intent, to: Stage::Purchase, count: 1 },
            ]
        );

        let dwell = stage_dwell(&histories, &filter);
        let awareness = dwell.iter().find(|d| d.stage == Stage::Awareness).unwrap();
        assert_eq!(awareness.samples, 2);
        assert!(approx(awareness.avg_hours, 3.0));
        let intent = dwell.iter().find(|d| d.stage == Stage::Intent).unwrap();
        assert!(approx(intent.avg_hours, 1.0));
        assert!(dwell.iter().all(|d| d.stage != Stage::Purchase));
    }
}
