//! Queue Worker Service
//!
//! A background worker that validates order events delivered by a push
//! broker.
//!
//! ## Architecture
//!
//! ```text
//! Broker listener thread
//!   ↓ (blocking push, backpressure at queue capacity)
//! QueueSubscriber<OrderRecord>
//!   ↓
//! Processor (task "order-events": circuit breaker, retry, thread pool)
//!   ↓
//! Acknowledgment per accepted record
//! ```
//!
//! Task policies come from `PIPELINE_ORDER_EVENTS_*` variables, see
//! [`message_pipeline::TaskSetting::from_env`].

pub mod broker;
pub mod config;
pub mod orders;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use futures::StreamExt;
use message_pipeline::{
    HealthState, MessagingType, Processor, QueueSubscriber, ResourceRegistry, SubscriberFlow,
    W3cPropagator, health_router, init_metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{SUBSCRIPTION, WorkerConfig};
use crate::orders::{OrderRecord, handle_order};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness checks: `/health`, `/healthz`
/// - Readiness checks: `/ready`, `/readyz`
/// - Queue monitoring: `/queues`
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

/// Run the queue worker
///
/// 1. Sets up error reports, structured logging and Prometheus metrics
/// 2. Builds the order task from the resource registry
/// 3. Feeds the processor from the broker listener until SIGINT/SIGTERM
/// 4. Drains the queue, then shuts down thread pools
///
/// # Errors
///
/// Returns an error if configuration is invalid, the task cannot be built or
/// the listener thread cannot be started.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, "Starting queue worker");
    info!("Environment: {:?}", environment);

    let config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let registry = Arc::new(
        ResourceRegistry::from_env(&[SUBSCRIPTION], message_pipeline::MetricsRegistry::shared())
            .wrap_err("Failed to load task settings")?,
    );
    info!(
        health_port = config.health_port,
        concurrency = config.concurrency,
        queue_capacity = config.queue.capacity,
        task = ?registry.setting(SUBSCRIPTION),
        "Worker configuration loaded"
    );

    let task = registry
        .task_builder::<OrderRecord, OrderRecord>(SUBSCRIPTION)?
        .sync(handle_order)?;
    let subscriber = Arc::new(QueueSubscriber::<OrderRecord>::new(
        SUBSCRIPTION,
        &config.queue,
        Arc::clone(registry.metrics()),
    )?);
    let processor = Processor::new(MessagingType::InMemory, subscriber.clone(), Arc::new(task))
        .with_propagator(Arc::new(W3cPropagator))
        .with_concurrency(config.concurrency);

    let health_state = HealthState::new(name, version)
        .with_queue(Arc::new(subscriber.queue().clone()));
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let stopper = subscriber.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        info!("Stopping subscriber, draining queued records");
        stopper.stop();
    });

    let publisher = broker::spawn_publisher(
        subscriber,
        Duration::from_millis(config.publish_interval_ms),
    )
    .wrap_err("Failed to start broker listener")?;

    let mut outcomes = processor.process();
    let (mut accepted, mut unacknowledged, mut failed) = (0u64, 0u64, 0u64);
    while let Some(outcome) = outcomes.next().await {
        match outcome {
            Ok(Some(result)) if result.acknowledged => accepted += 1,
            Ok(Some(result)) => {
                unacknowledged += 1;
                warn!(message_id = %result.data.id, "Accepted order was not acknowledged");
            }
            Ok(None) => debug!("Task produced no result"),
            Err(e) => {
                failed += 1;
                debug!(error = %e, "Order not processed");
            }
        }
    }

    let published = tokio::task::spawn_blocking(move || publisher.join())
        .await
        .wrap_err("Broker listener join task failed")?
        .map_err(|_| eyre::eyre!("Broker listener thread panicked"))?;
    registry.shutdown();

    info!(published, accepted, unacknowledged, failed, "Queue worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
