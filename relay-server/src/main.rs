mod api;
mod config;
mod device;
mod distribution;
mod quic;

use anyhow::Result;
use api::{AppState, HttpServer};
use clap::Parser;
use common::model::TomlModelStore;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🚀 Relay server starting...");

    let config = config::Config::parse();
    let addr = config.listen_addr()?;
    info!("✓ Configuration loaded");

    // 创建共享状态
    let store = TomlModelStore::open(&config.home())?;
    info!("✓ Model store at {:?}", store.model_dir());
    let device_manager = device::DeviceManager::new();
    let frame_hub = distribution::FrameHub::new(config.frame_buffer);

    let quic_server = quic::QuicServer::new(addr, device_manager.clone(), frame_hub.clone())?;
    let endpoint = quic_server.endpoint();
    info!("✓ QUIC server listening on {}", quic_server.local_addr()?);

    let state = AppState {
        device_manager,
        frame_hub,
        store: Arc::new(store),
        target_client_id: Arc::from(config.target_client_id.as_str()),
        call_timeout: config.call_timeout(),
    };
    let http_server = HttpServer::new(addr, state);

    info!("✅ Relay server ready!");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let quic_handle = tokio::spawn(async move {
        if let Err(e) = quic_server.run().await {
            error!("QUIC server error: {}", e);
        }
    });

    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        };
        if let Err(e) = http_server.run(shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("⏹️  Shutting down...");
    let _ = shutdown_tx.send(true);
    endpoint.close(0u32.into(), b"server shutdown");

    let _ = tokio::try_join!(quic_handle, http_handle);
    endpoint.wait_idle().await;
    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
