use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload_service::{
    start_api_server, storage, AppState, Config, ConnectionStatus, ConsumerLoop, IngestSettings,
    KafkaPublisher, KafkaRecordSource, ProduceQueue, ProducerLoop, UploadIngestor,
    ValidationHandler, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting upload service"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let pool = WorkerPool::new(config.pipeline.max_workers);
    let storage = storage::from_config(&config.storage, pool.clone(), config.url_expiry())
        .await
        .context("Failed to initialize storage")?;
    let queue = Arc::new(ProduceQueue::new(config.pipeline.produce_queue_capacity));
    let status = Arc::new(ConnectionStatus::new());

    info!(
        driver = ?config.storage.driver,
        max_workers = pool.size(),
        queue_capacity = queue.capacity(),
        "Pipeline components initialized"
    );

    let producer_loop = ProducerLoop::new(
        Arc::new(KafkaPublisher::new(config.kafka.clone())),
        queue.clone(),
        status.clone(),
        config.retry_interval(),
        config.idle_interval(),
    );

    let handler = Arc::new(ValidationHandler::new(
        storage.clone(),
        queue.clone(),
        config.kafka.available_topic.clone(),
    ));
    let consumer_loop = ConsumerLoop::new(
        Arc::new(KafkaRecordSource::new(config.kafka.clone())),
        handler,
        status.clone(),
        config.kafka.validation_topic.clone(),
        config.retry_interval(),
        config.idle_interval(),
    );

    let ingestor = Arc::new(UploadIngestor::new(
        storage.clone(),
        queue.clone(),
        pool,
        IngestSettings::from_config(&config),
    ));

    let api_state = AppState {
        ingestor,
        storage,
        status,
    };

    let shutdown = CancellationToken::new();

    // Spawn broker loops
    let producer_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { producer_loop.run(shutdown).await }
    });
    let consumer_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer_loop.run(shutdown).await }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Upload service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!(queue_len = queue.len(), "Shutting down upload service");

    shutdown.cancel();
    api_handle.abort();

    for (name, handle) in [("producer", producer_handle), ("consumer", consumer_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Broker loop ended abnormally");
        }
    }

    info!("Upload service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
