mod config;
mod device_service;
mod quic;
mod stream;
mod supervisor;
mod video;

use anyhow::Result;
use clap::Parser;
use common::model::TomlModelStore;
use common::transport::client_endpoint;
use config::{Cli, Command, Config};
use device_service::DeviceService;
use quic::ControlChannel;
use std::sync::Arc;
use stream::ProcessLauncher;
use supervisor::SupervisorSettings;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 日志写到 stderr，stdout 留给推流子进程输出帧
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Produce(args)) => {
            let home = cli.config.home();
            let fps = cli.config.camera_fps;
            tokio::task::spawn_blocking(move || stream::run_producer(&home, &args.model, fps))
                .await?
        }
        Some(Command::Run) | None => run(cli.config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!("🎥 Device client starting...");

    let home = config.home();
    let store = TomlModelStore::open(&home)?;
    info!("✓ Model store at {:?}", store.model_dir());

    let server_addr = config.server_addr()?;
    info!("  Client ID: {}", config.client_id);
    info!("  Server: {}", server_addr);

    let channel = ControlChannel::new(
        client_endpoint()?,
        server_addr,
        config.client_id.clone(),
        config.reconnect_policy(),
    );
    let launcher = ProcessLauncher::current_exe(&home, config.camera_fps)?;
    let settings = SupervisorSettings {
        queue_capacity: usize::from(config.frame_queue_capacity),
        teardown_timeout: config.teardown_timeout(),
    };

    let service = DeviceService::new(channel, Arc::new(store), Arc::new(launcher), settings);
    if let Err(e) = service.run(shutdown_signal()).await {
        error!("✗ Failed to connect to the server: {}", e);
        return Err(e.into());
    }

    info!("Device client stopped");
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
