use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meli_webhook_gateway::config::LogFormat;
use meli_webhook_gateway::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration decides the log format, so it is loaded first
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info", LogFormat::Pretty);
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    init_tracing(&config.log_level, config.log_format);

    info!(
        "Starting Mercado Livre webhook gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// An unparsable `RUST_LOG` falls back to `info`.
fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().with_current_span(true).init(),
        LogFormat::Pretty => builder.with_thread_ids(true).init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        timeout_ms = config.webhook_timeout.as_millis() as u64,
        budget_ms = config.processing_budget().as_millis() as u64,
        "Configuration loaded"
    );

    if config.webhook_secret.is_none() {
        warn!("ML_WEBHOOK_SECRET is not set: every webhook delivery will be rejected");
    }
    if !config.enforce_ip_allowlist {
        warn!("Sender IP allowlist is not enforced");
    }

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Metrics disabled (METRICS_PORT=0)");
    }

    let state = AppState::connect(config.clone()).await.map_err(|e| {
        error!("Failed to initialize dependencies: {e}");
        exitcode::UNAVAILABLE
    })?;
    info!(store = state.store.backend(), "Store connected");

    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health                          - Health check");
    info!("  GET  /ready                           - Readiness check");
    info!("  POST /webhooks/mercadolibre           - Marketplace notifications");
    info!("  GET  /webhooks/mercadolibre           - Webhook capability descriptor");
    if config.admin_enabled() {
        info!("  POST /admin/recovery/{{tenant_id}}      - Run missed-feed recovery");
        info!("  GET  /admin/recovery/{{tenant_id}}/last - Last recovery summary");
        info!("  GET  /admin/security/events           - Recent security events");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    info!("HTTP server stopped, waiting for background work...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
