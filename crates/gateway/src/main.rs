//! Gateway service entry point.
//!
//! WebSocket gateway maintaining the live-data subscription cache.

use anyhow::Result;
use gateway::{
    create_router, AllowAllAuthorizationService, AppState, ClientRegistry,
    HttpSubscriptionAuthorizationService, SubscriptionAuthorizationService,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subscription_cache::{
    ConnectionMaintenanceTask, RedisSubscriptionCacheService, SubscriptionCacheService,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    // Read configuration from environment
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let auth_check_endpoint = env::var("AUTH_CHECK_ENDPOINT").ok();
    let maintenance_interval_secs: u64 = env::var("MAINTENANCE_INTERVAL_SECS")
        .unwrap_or_else(|_| "300".to_string())
        .parse()
        .expect("MAINTENANCE_INTERVAL_SECS must be a number");
    let maintenance_dump_cache = env::var("MAINTENANCE_DUMP_CACHE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    info!("Configuration:");
    info!("  REDIS_URL: {}", redis_url);
    info!("  HTTP_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!(
        "  AUTH_CHECK_ENDPOINT: {}",
        auth_check_endpoint.as_deref().unwrap_or("<allow all>")
    );
    info!("  MAINTENANCE_INTERVAL_SECS: {}", maintenance_interval_secs);
    info!("  MAINTENANCE_DUMP_CACHE: {}", maintenance_dump_cache);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Connect to Redis
    info!("Connecting to Redis at {}", redis_url);
    let cache: Arc<dyn SubscriptionCacheService> =
        Arc::new(RedisSubscriptionCacheService::new(&redis_url)?);
    info!("Connected to Redis");

    // Create client registry
    let registry = Arc::new(ClientRegistry::new());

    // Create authorization service
    let auth: Arc<dyn SubscriptionAuthorizationService> = match auth_check_endpoint {
        Some(endpoint) => Arc::new(HttpSubscriptionAuthorizationService::new(endpoint)),
        None => {
            warn!("No AUTH_CHECK_ENDPOINT configured, allowing all subscribe requests");
            Arc::new(AllowAllAuthorizationService)
        }
    };

    // Create maintenance task reconciling the cache against open sockets
    let maintenance = ConnectionMaintenanceTask::new(
        cache.clone(),
        registry.clone(),
        maintenance_dump_cache,
    );

    // Create shutdown channel for maintenance loop
    let (maintenance_shutdown_tx, mut maintenance_shutdown_rx) = mpsc::channel::<()>(1);

    // Spawn maintenance loop
    let maintenance_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(maintenance_interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match maintenance.run().await {
                        Ok(report) => info!(
                            "Maintenance sweep: {} preserved, {} cleaned up",
                            report.preserved_connections.len(),
                            report.cleaned_up_connections.len()
                        ),
                        Err(e) => error!("Maintenance sweep failed: {:?}", e),
                    }
                }
                _ = maintenance_shutdown_rx.recv() => break,
            }
        }
    });

    // Create application state
    let state = Arc::new(AppState {
        registry,
        cache,
        auth,
    });

    // Create HTTP router
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown maintenance loop
    info!("Shutting down maintenance task...");
    let _ = maintenance_shutdown_tx.send(()).await;
    let _ = maintenance_handle.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
