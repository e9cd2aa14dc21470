use anyhow::{Context, Result};
use gallery_storage::{Config, KafkaSubscription, UploadPipeline};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Gallery Storage Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // This process only reconciles; uploads are admitted by processes that
    // embed the library pipeline
    let listener = UploadPipeline::connect_listener(&config)
        .await
        .context("Failed to initialize reconciliation listener")?;

    let subscription = KafkaSubscription::new(&config.kafka)
        .context("Failed to subscribe to notification bus")?;

    // Start the reconciliation listener
    let cancel = CancellationToken::new();
    let listener_cancel = cancel.clone();
    let listener_handle = tokio::spawn(async move {
        listener.run(subscription, listener_cancel).await;
    });

    info!("Storage service ready");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage service");

    cancel.cancel();
    if let Err(e) = listener_handle.await {
        error!(error = %e, "Reconciliation listener task failed");
    }

    info!("Storage service stopped");

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

    info!(port, "Prometheus metrics exporter started");

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
