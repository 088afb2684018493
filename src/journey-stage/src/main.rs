//! Journey stage service: ingests session events, keeps each session's
//! funnel stage current and sends one action per stage change.
//!
//! Runs the automation scheduler until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use journey_core::config::{AppConfig, PredictionBackendKind};
use journey_engine::JourneyStageEngine;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "journey-stage")]
#[command(about = "Behavioral funnel stage engine with automated stage actions")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "JOURNEY_STAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "JOURNEY_STAGE__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between automation sweeps (overrides config)
    #[arg(long, env = "JOURNEY_STAGE__SCHEDULER__INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Prediction backend: disabled, rules, command or http (overrides config)
    #[arg(long)]
    prediction_backend: Option<PredictionBackendKind>,

    /// Load demo sessions at startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,

    /// Do not start the automation scheduler
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(
        config.metrics.host.parse().context("invalid metrics host")?,
        config.metrics.port,
    );
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journey_stage=info,journey_engine=info,journey_channels=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Journey stage engine starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.interval_secs {
        config.scheduler.interval_secs = interval;
    }
    if let Some(backend) = cli.prediction_backend {
        config.prediction.backend = backend;
    }
    if cli.no_scheduler {
        config.scheduler.enabled = false;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        prediction_backend = ?config.prediction.backend,
        interval_secs = config.scheduler.interval_secs,
        scheduler_enabled = config.scheduler.enabled,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let engine = JourneyStageEngine::from_config(&config)?;

    if cli.seed_demo {
        let seeded = engine.seed_demo().await?;
        for row in engine.get_analytics(None, None).await? {
            info!(
                stage = %row.stage,
                count = row.count,
                avg_confidence = row.avg_confidence,
                "Demo stage rollup"
            );
        }
        info!(events = seeded, "Demo data loaded");
    }

    if config.scheduler.enabled {
        engine.start_automation()?;
    } else {
        info!("Automation scheduler disabled");
    }

    info!("Journey stage engine is running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    engine.stop_automation().await;
    Ok(())
}
