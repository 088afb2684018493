use thiserror::Error;

pub type JourneyResult<T> = Result<T, JourneyError>;

#[derive(Error, Debug)]
pub enum JourneyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Event log error: {0}")]
    EventLog(String),

    #[error("Annotation store error: {0}")]
    AnnotationStore(String),

    #[error("Prediction error: {0}")]
    Prediction(String),

    #[error("Action dispatch error: {0}")]
    Dispatch(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for JourneyError {
    fn from(err: config::ConfigError) -> Self {
        JourneyError::Config(err.to_string())
    }
}
