// ABOUTME: WebSocket gateway binary: registers connections in the shared registry
// ABOUTME: and relays topic broadcasts from any instance to the sockets held here

mod config;
mod dispatch;
mod handlers;
mod routes;

use dotenv::dotenv;
use socket_registry::{connect_store, RelayListener, SocketManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::GatewayConfig;
use crate::routes::AppState;

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

fn init_tracing() {
    // JSON in production for log aggregation
    let is_production = std::env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let worker_threads = config::worker_threads();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(async_main(worker_threads))
}

async fn async_main(worker_threads: usize) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Configuration Error:\n{}\n", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        worker_threads,
        backend = %config.registry.backend,
        "Socket gateway starting"
    );

    let store = connect_store(&config.registry).await?;
    let manager = Arc::new(SocketManager::new(store));
    tracing::info!("✔︎ Membership store connected ({})", config.registry.backend);

    let listener = RelayListener::start(manager.clone()).await?;
    tracing::info!("✔︎ Relay listener started");

    let dispatcher = handlers::dispatcher();
    tracing::info!(
        message_types = ?dispatcher.message_types(),
        "✔︎ Message handlers registered"
    );

    let app = routes::router(Arc::new(AppState {
        manager,
        dispatcher,
    }));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let tcp_listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🌐 WebSocket gateway listening on ws://{}/ws?id=<clientId>", addr);

    let shutdown_signal = Arc::new(Notify::new());
    let shutdown_for_server = shutdown_signal.clone();

    let server_handle = tokio::spawn(async move {
        axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                shutdown_for_server.notified().await;
            })
            .await
    });

    wait_for_shutdown_signal().await;
    shutdown_signal.notify_waiters();

    tracing::info!("Shutting down gracefully...");

    // Drain HTTP and WebSocket tasks before the relay goes away
    match tokio::time::timeout(Duration::from_secs(25), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::warn!("Server task error: {:?}", e),
        Err(_) => tracing::warn!("Server shutdown timed out after 25s"),
    }

    listener.stop().await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}
