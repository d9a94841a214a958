use crate::device::DeviceManager;
use crate::distribution::FrameHub;
use common::transport::server_endpoint;
use common::Result;
use quinn::Endpoint;
use std::net::SocketAddr;
use tracing::{error, info};

pub struct QuicServer {
    endpoint: Endpoint,
    device_manager: DeviceManager,
    frame_hub: FrameHub,
}

impl QuicServer {
    pub fn new(addr: SocketAddr, device_manager: DeviceManager, frame_hub: FrameHub) -> Result<Self> {
        let endpoint = server_endpoint(addr)?;
        Ok(Self {
            endpoint,
            device_manager,
            frame_hub,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accepts connections until the endpoint is closed.
    pub async fn run(&self) -> Result<()> {
        info!("QUIC server running...");

        while let Some(conn) = self.endpoint.accept().await {
            let device_manager = self.device_manager.clone();
            let frame_hub = self.frame_hub.clone();

            tokio::spawn(async move {
                match conn.await {
                    Ok(connection) => {
                        info!("New QUIC connection from: {}", connection.remote_address());
                        super::connection::handle_connection(connection, device_manager, frame_hub)
                            .await;
                    }
                    Err(e) => {
                        error!("Connection failed: {}", e);
                    }
                }
            });
        }

        info!("QUIC server stopped");
        Ok(())
    }
}
