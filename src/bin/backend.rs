//! Conversion Backend Service
//!
//! Serves one capability class: converts synchronously over HTTP, and
//! consumes the class's Redis queue, pushing each result to the job's
//! callback URL.
//!
//! ## Lifecycle
//!
//! 1. register with Consul (name, tags, `/health` check every 10s)
//! 2. spawn the queue consumer (reconnects every 5s while Redis is away)
//! 3. serve HTTP until Ctrl+C / SIGTERM
//! 4. stop the consumer, deregister
//!
//! ## Configuration
//!
//! Environment variables (see `config` for the full list):
//! - `CONVERT_CAPABILITY`: `document` or `image`
//! - `CONVERT_ADVERTISE_ADDRESS`: address announced to Consul (default: `$HOSTNAME`)
//! - `BASIC_AUTH_USERNAME` / `BASIC_AUTH_PASSWORD`: shared credentials
//! - `CONSUL_HTTP_ADDR`, `REDIS_URL`, `CONVERT_CONFIG`
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use conversion_dispatch::{
    config::{self, BackendConfig},
    consumer::JobConsumer,
    converter,
    http::{self, shutdown_signal},
    notifier::HttpCallbackNotifier,
    queue::redis_queue::RedisConnector,
    registry::{ConsulRegistry, Registration},
    telemetry,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let config = config::load_backend_config().context("Failed to load configuration")?;

    if let Err(e) = telemetry::init_telemetry(config.capability.service_name()) {
        warn!("Failed to initialize telemetry: {}", e);
    }

    let service_id = config.service_id();
    info!(
        capability = %config.capability,
        service_id = %service_id,
        listen_addr = %config.listen_addr,
        "Starting conversion backend"
    );

    let registry = ConsulRegistry::new(&config.consul_http_addr, config.registry_timeout())
        .context("Failed to create registry client")?;
    let registration = registration(&config, &service_id);
    if config.register_on_start {
        registry
            .register(&registration)
            .await
            .context("Failed to register with Consul")?;
    }

    let converter = converter::for_class(config.capability, config.tools.clone());
    let notifier = HttpCallbackNotifier::new(config.callback_timeout())
        .context("Failed to create callback client")?;

    let cancel = CancellationToken::new();
    let consumer = JobConsumer::new(
        RedisConnector::new(config.redis_url.clone(), config.consumer_name()),
        converter.clone(),
        Arc::new(notifier),
    )
    .with_policy(config.reconnect_policy());
    let consumer_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { consumer.run(cancel).await }
    });

    let app = http::backend::router(
        converter,
        config.credentials.clone(),
        config.max_upload_bytes,
    );
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    info!("Backend listening on {}", config.listen_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Shutting down, waiting for in-flight job...");
    cancel.cancel();
    match consumer_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Job consumer stopped: {}", e),
        Err(e) => error!("Job consumer task failed: {}", e),
    }

    if config.register_on_start {
        if let Err(e) = registry.deregister(&registration.instance.id).await {
            warn!("Failed to deregister: {}", e);
        }
    }

    info!("Backend shutdown complete");
    telemetry::shutdown_telemetry();
    served
}

fn registration(config: &BackendConfig, service_id: &str) -> Registration {
    Registration::for_backend(
        config.capability,
        service_id,
        config.advertise_address(),
        config.advertise_port(),
        &config.health_check_scheme,
        config.health_check_interval(),
    )
}
