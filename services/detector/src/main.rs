use anyhow::{Context, Result};
use checkpoint_detector::alerts::{AlertDispatcher, SnsAlertChannel};
use checkpoint_detector::api::{start_api_server, AppState};
use checkpoint_detector::config::Config;
use checkpoint_detector::recognition::{RecognitionAdapter, RekognitionProvider};
use checkpoint_detector::registry::{PgRegistry, RegistryMatcher};
use checkpoint_detector::result_store::{PgResultStore, ResultStore};
use checkpoint_detector::sqs_consumer::EventQueueConsumer;
use checkpoint_detector::{aws, db, Pipeline};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Checkpoint Detector Service"
    );

    if let Some(shortfall) = config.visibility_shortfall(1) {
        warn!(
            visibility_timeout_secs = config.queue.visibility_timeout_secs,
            event_budget_secs = config.event_time_budget(1).as_secs(),
            shortfall_secs = shortfall.as_secs(),
            "Queue visibility timeout is shorter than the worst-case alerting event"
        );
    }

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Database
    let pool = db::connect(&config.database)
        .await
        .context("Failed to initialize database pool")?;

    if config.database.run_migrations {
        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
    }

    // AWS clients
    let sdk_config = aws::load_sdk_config(&config.aws).await;

    let store: Arc<dyn ResultStore> = Arc::new(PgResultStore::new(pool.clone()));

    let pipeline = Arc::new(Pipeline::new(
        RecognitionAdapter::new(
            Arc::new(RekognitionProvider::new(&sdk_config)),
            &config.recognition,
        ),
        store.clone(),
        RegistryMatcher::new(Arc::new(PgRegistry::new(pool.clone()))),
        AlertDispatcher::new(
            Arc::new(SnsAlertChannel::new(&sdk_config, &config.alerts.topic_arn)),
            &config.alerts,
            config.pipeline.stage_timeout(),
        ),
        &config.pipeline,
    ));

    let consumer = EventQueueConsumer::new(&sdk_config, &config.queue, pipeline.clone());

    let api_state = AppState {
        pipeline,
        store,
        pool,
    };

    let shutdown = CancellationToken::new();

    // Spawn queue consumer task
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run(consumer_shutdown).await {
            error!(error = %e, "Queue consumer error");
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Detector service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down detector service");

    // In-flight events finish before the tasks return
    shutdown.cancel();
    let (consumer_result, api_result) = tokio::join!(consumer_handle, api_handle);
    if let Err(e) = consumer_result {
        error!(error = %e, "Queue consumer task panicked");
    }
    if let Err(e) = api_result {
        error!(error = %e, "API server task panicked");
    }

    info!("Detector service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
