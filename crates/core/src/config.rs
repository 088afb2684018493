use std::path::Path;

use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `JOURNEY_STAGE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which prediction backend refines the rule classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionBackendKind {
    Disabled,
    Rules,
    Command,
    Http,
}

impl std::str::FromStr for PredictionBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "rules" => Ok(Self::Rules),
            "command" => Ok(Self::Command),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown prediction backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "default_prediction_backend")]
    pub backend: PredictionBackendKind,
    #[serde(default = "default_prediction_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_prediction_command")]
    pub command: String,
    #[serde(default = "default_prediction_args")]
    pub args: Vec<String>,
    #[serde(default = "default_prediction_url")]
    pub url: String,
    /// Most recent events serialized as context for the backend.
    #[serde(default = "default_prediction_max_events")]
    pub max_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Sessions reconciled in parallel within one sweep.
    #[serde(default = "default_sweep_concurrency")]
    pub concurrency: usize,
    /// 0 keeps an action window open until the stage changes.
    #[serde(default)]
    pub rearm_after_sweeps: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannelKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notification_channel")]
    pub channel: NotificationChannelKind,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notification_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_prediction_backend() -> PredictionBackendKind {
    PredictionBackendKind::Disabled
}
fn default_prediction_timeout_ms() -> u64 {
    3000
}
fn default_prediction_command() -> String {
    "python3".to_string()
}
fn default_prediction_args() -> Vec<String> {
    vec!["predict.py".to_string()]
}
fn default_prediction_url() -> String {
    "http://localhost:8000/predict".to_string()
}
fn default_prediction_max_events() -> usize {
    100
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    60
}
fn default_sweep_concurrency() -> usize {
    8
}
fn default_history_limit() -> usize {
    100
}
fn default_notification_channel() -> NotificationChannelKind {
    NotificationChannelKind::Log
}
fn default_notification_timeout_ms() -> u64 {
    5000
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            backend: default_prediction_backend(),
            timeout_ms: default_prediction_timeout_ms(),
            command: default_prediction_command(),
            args: default_prediction_args(),
            url: default_prediction_url(),
            max_events: default_prediction_max_events(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_secs: default_interval_secs(),
            concurrency: default_sweep_concurrency(),
            rearm_after_sweeps: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: default_notification_channel(),
            webhook_url: None,
            timeout_ms: default_notification_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            prediction: PredictionConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            notifications: NotificationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("JOURNEY_STAGE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("prediction.args"),
            )
            .build()?;
        config.try_deserialize()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::JourneyError> {
        if self.prediction.timeout_ms == 0 {
            return Err(crate::JourneyError::Config(
                "prediction.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(crate::JourneyError::Config(
                "scheduler.interval_secs must be greater than zero".into(),
            ));
        }
        if self.scheduler.concurrency == 0 {
            return Err(crate::JourneyError::Config(
                "scheduler.concurrency must be greater than zero".into(),
            ));
        }
        if self.notifications.channel == NotificationChannelKind::Webhook
            && self.notifications.webhook_url.is_none()
        {
            return Err(crate::JourneyError::Config(
                "notifications.webhook_url is required for the webhook channel".into(),
            ));
        }
        Ok(())
    }
}
