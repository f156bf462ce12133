//! Orders Worker Service
//!
//! A background worker that handles order messages from Redis streams.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (orders:placed)         ── group orders:placed:consumers ──> OrdersWorker::on_placed
//! Redis Stream (orders:events)         ── group orders:events:audit ──────> OrdersWorker::on_event
//! Redis Stream (orders:heartbeat)      ── group orders:heartbeat:consumers > OrdersWorker::on_heartbeat
//! ```
//!
//! ## Features
//!
//! - Consumer group support for horizontal scaling
//! - Redelivery of abandoned and stale messages after a delay
//! - Dead-lettering to `<stream>:dlq` once the delivery limit is reached
//! - Graceful shutdown with a grace period
//! - Health check endpoints for Kubernetes
//! - Optional order webhook with retries

pub mod orders;

use axum::Router;
use core_config::redis::RedisConfig;
use core_config::worker::WorkerSettings;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use message_worker::{
    BrokerError, HandlerRegistry, HealthState, MessageWorker, RedisStreamsBroker,
    ResilientHttpClient, RetryPolicy, RetryPolicyConfig, WorkerConfig, health_router, metrics,
};
use orders::OrdersWorker;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness checks: `/health`, `/healthz`
/// - Readiness checks: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Connect the Redis Streams broker, retrying while the server is unreachable.
async fn connect_broker(
    redis_config: &RedisConfig,
    settings: &WorkerSettings,
    policy: &RetryPolicy,
) -> std::result::Result<RedisStreamsBroker, BrokerError> {
    let client = redis::Client::open(redis_config.uri.as_str())?;
    let client = &client;

    policy
        .execute(move || async move {
            RedisStreamsBroker::from_settings(client.clone(), redis_config, settings).await
        })
        .await
}

/// Run the orders worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads worker, retry and Redis settings from the environment
/// 3. Connects to Redis and registers the order handlers
/// 4. Runs the consumption loop until SIGINT/SIGTERM
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis is unreachable after
/// retries, the handler bindings are invalid, or no subscription can be opened.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = app_name, version = app_version, "Starting orders worker service");
    info!("Environment: {:?}", environment);

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let retry = RetryPolicyConfig::from_env().wrap_err("Failed to load retry policy")?;
    let policy = RetryPolicy::new(retry.clone()).wrap_err("Invalid retry policy")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let broker = connect_broker(&redis_config, &settings, &policy)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let mut orders = OrdersWorker::new();
    if let Ok(url) = std::env::var("ORDERS_WEBHOOK_URL") {
        info!(url = %url, "Order webhook enabled");
        orders = orders.with_webhook(ResilientHttpClient::new(reqwest::Client::new(), policy.clone()), url);
    }

    let mut registry = HandlerRegistry::new();
    let descriptor = registry
        .register(Arc::new(orders))
        .wrap_err("Invalid order handler bindings")?;

    info!(
        consumer_id = %broker.consumer_id(),
        block_ms = settings.receive_block_ms,
        claim_idle_ms = settings.claim_idle_ms,
        response_timeout_ms = redis_config.response_timeout_ms,
        max_deliveries = settings.max_deliveries,
        redelivery_delay_ms = settings.redelivery_delay_ms,
        "Broker configuration loaded"
    );

    let config = WorkerConfig::from_settings(&settings).with_settle_retry(retry);
    let worker = Arc::new(
        MessageWorker::new(descriptor, Arc::new(broker), config)
            .wrap_err("Failed to create message worker")?,
    );

    // Set up a shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(worker.clone(), app_name, app_version);
    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    worker
        .run(shutdown_rx)
        .await
        .wrap_err("Message worker failed")?;

    info!("Orders worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate() => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(unix)]
async fn terminate() -> Result<()> {
    signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install signal handler")?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> Result<()> {
    std::future::pending().await
}
