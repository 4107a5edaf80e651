//! Conversion Dispatcher Service
//!
//! Accepts conversion requests over HTTP, resolves a live backend for the
//! requested pair through Consul, then either forwards the request
//! synchronously or enqueues it on the capability class's Redis queue.
//!
//! ## Configuration
//!
//! Environment variables (see `config` for the full list):
//! - `BASIC_AUTH_USERNAME` / `BASIC_AUTH_PASSWORD`: shared credentials
//! - `CONSUL_HTTP_ADDR`: Consul agent (default: localhost:8500)
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `CONVERT_CONFIG`: optional TOML file
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use conversion_dispatch::{
    config,
    dispatcher::{Dispatcher, HttpForwarder},
    http::{self, shutdown_signal},
    queue::RedisJobQueue,
    registry::ConsulRegistry,
    telemetry,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    if let Err(e) = telemetry::init_telemetry("conversion-dispatcher") {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting conversion dispatcher");

    let config = config::load_dispatcher_config().context("Failed to load configuration")?;
    info!(
        listen_addr = %config.listen_addr,
        consul = %config.consul_http_addr,
        backend_scheme = %config.backend_scheme,
        "Configuration loaded"
    );

    let registry = ConsulRegistry::new(&config.consul_http_addr, config.registry_timeout())
        .context("Failed to create registry client")?;
    let publisher = RedisJobQueue::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis");

    let forwarder = HttpForwarder::new(
        config.backend_scheme.clone(),
        config.forward_timeout(),
        config.backend_accept_invalid_certs,
        config.credentials.clone(),
    )
    .context("Failed to create backend client")?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        Arc::new(publisher),
        Arc::new(forwarder),
    ));
    let app = http::dispatcher::router(
        dispatcher,
        config.credentials.clone(),
        config.max_upload_bytes,
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    info!("Dispatcher listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Dispatcher shutdown complete");
    telemetry::shutdown_telemetry();
    Ok(())
}
