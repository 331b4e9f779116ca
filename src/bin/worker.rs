use idcheck_pipeline::{
    app_state::AppState,
    config::WorkerConfig,
    models::decision::Stage,
    routes,
    services::{
        acquisition::ImageFetcher,
        artifacts::ArtifactStore,
        scoring::InferenceClient,
        stage::{BiometricStage, DocumentStage, StageProcessor},
        supervisor::{ConnectionSupervisor, RedisConnector},
    },
    worker::StageWorker,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = WorkerConfig::from_env().expect("Failed to load configuration");

    tracing::info!(stage = %config.stage, worker_id = %config.worker_id, "Starting verification worker");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Collaborators are created once and shared read-only for the process lifetime
    let images = Arc::new(
        ImageFetcher::new(config.fetch_timeout()).expect("Failed to initialize image fetcher"),
    );
    let artifacts =
        ArtifactStore::new(&config.artifact_dir).expect("Failed to initialize artifact store");

    let scorer_url = config.scorer_url().expect("Scorer endpoint not configured");
    let inference = Arc::new(
        InferenceClient::new(scorer_url, config.scorer_api_token.clone())
            .expect("Failed to initialize inference client"),
    );
    match inference.health_check().await {
        Ok(()) => tracing::info!(url = %scorer_url, "Inference endpoint ready"),
        Err(e) => tracing::warn!(url = %scorer_url, error = %e, "Inference endpoint not ready yet"),
    }

    let processor: Arc<dyn StageProcessor> = match config.stage {
        Stage::Document => Arc::new(DocumentStage::new(images, inference, artifacts)),
        Stage::Biometric => Arc::new(BiometricStage::new(images, inference, artifacts)),
    };
    let worker = StageWorker::new(processor, config.topology());
    let subscription = worker.subscription(config.poll_wait(), config.lease_ttl());

    let connector = RedisConnector::new(
        &config.redis_url,
        &config.worker_id,
        config.prefetch,
        config.lease_ttl(),
    )
    .expect("Invalid Redis URL");
    let supervisor = ConnectionSupervisor::new(connector, config.reconnect_delay());

    // Health and metrics endpoints
    let state = AppState::new(config.stage, &config.worker_id, supervisor.subscribe());
    let app = routes::router(state, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&config.health_addr)
        .await
        .expect("Failed to bind health address");
    tracing::info!("Health endpoint listening on {}", config.health_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    tracing::info!(queue = %subscription.input, "Worker ready, starting consume loop");
    supervisor.run(&subscription, &worker, shutdown).await;
    tracing::info!("Worker stopped");
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
        _ = ctrl_c => tracing::info!("Received Ctrl+C, finishing current message"),
        _ = terminate => tracing::info!("Received SIGTERM, finishing current message"),
    }
}
