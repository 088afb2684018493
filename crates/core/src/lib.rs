//! Shared domain model for the journey stage engine: events, stages,
//! annotations, configuration, errors and the storage collaborators.

pub mod annotation_store;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod event_log;
pub mod types;

pub use annotation_store::{
    AnnotationStore, FailingAnnotationStore, InMemoryAnnotationStore, WriteOutcome,
};
pub use config::AppConfig;
pub use error::{JourneyError, JourneyResult};
pub use event_log::{EventLog, FailingEventLog, InMemoryEventLog};
