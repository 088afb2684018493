//! Journey stage engine: derives a behavioral funnel stage for each session
//! from its events, refines it through a pluggable prediction backend, keeps
//! the persisted stage consistent under concurrent writes, and periodically
//! triggers one action per stage change.

pub mod backends;
pub mod classifier;
pub mod engine;
pub mod prediction;
pub mod reconciler;
pub mod scheduler;

pub use classifier::RuleClassifier;
pub use engine::{EngineBuilder, IngestOutcome, JourneyStageEngine};
pub use prediction::{Prediction, PredictionAdapter, PredictionBackend, PredictionError};
pub use reconciler::StageReconciler;
pub use scheduler::{AutomationScheduler, SweepOutcome, SweepReport};
