use anyhow::{Context, Result};
use clap::Parser;
use energy_accumulator::config::{AccumulatorOptions, Config};
use energy_accumulator::http::{self, HttpState};
use energy_accumulator::service::AccumulatorService;
use energy_accumulator::sources::{HistoryStore, LiveStateSource, StateRegistry};
use energy_accumulator::store::AccumulatorStore;
use energy_accumulator::{cli, mqtt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing(default_filter: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = Config::from_env()?;
    if let Some(options) = args.options {
        config.options_path = Some(options);
    }
    if let Some(bind) = args.bind {
        config.http_bind = bind;
    }
    if let Some(storage) = args.storage {
        config.storage_path = storage;
    }

    let (options, warnings) = AccumulatorOptions::load(config.options_path.as_deref());
    init_tracing(options.log_filter())?;
    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    let registry = StateRegistry::new(config.history_retention, config.recorder_enabled);
    let live: Arc<dyn LiveStateSource> = Arc::new(registry.clone());
    let history: Option<Arc<dyn HistoryStore>> = if registry.records_history() {
        Some(Arc::new(registry.clone()))
    } else {
        None
    };
    let store = AccumulatorStore::new(config.storage_path.clone());
    tracing::info!(
        storage = %store.path().display(),
        timezone = %config.timezone,
        sensors = options.power_sensors.len(),
        interval_seconds = options.sample_interval_seconds,
        statistical = options.use_statistical_calculation,
        "energy-accumulator starting"
    );

    let sources = options.power_sensors.clone();
    let service =
        AccumulatorService::build(options, config.timezone, live, history, store).await;

    let cancel = CancellationToken::new();
    let mut tasks = service.start(cancel.clone()).await;

    if let Some(mqtt_config) = config.mqtt.clone() {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = mqtt::run_listener(mqtt_config, registry, sources, cancel).await {
                tracing::error!(error = %err, "MQTT state listener exited");
            }
        }));
    }

    let app = http::router(HttpState {
        registry,
        service: service.clone(),
    });
    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind energy-accumulator listener on {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "energy-accumulator HTTP listening");
    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task ended abnormally");
        }
    }
    match http_handle.await {
        Ok(Err(err)) => tracing::warn!(error = %err, "HTTP server stopped with error"),
        Err(err) => tracing::warn!(error = %err, "HTTP server task ended abnormally"),
        Ok(Ok(())) => {}
    }
    service.shutdown().await;
    Ok(())
}
