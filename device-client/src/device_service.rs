use crate::quic::ControlChannel;
use crate::stream::ProducerLauncher;
use crate::supervisor::{RelayEnd, StreamSupervisor, SupervisorHandle, SupervisorSettings};
use common::model::ModelStore;
use common::Result;
use quinn::Connection;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct DeviceService {
    channel: ControlChannel,
    store: Arc<dyn ModelStore>,
    launcher: Arc<dyn ProducerLauncher>,
    settings: SupervisorSettings,
}

impl DeviceService {
    pub fn new(
        channel: ControlChannel,
        store: Arc<dyn ModelStore>,
        launcher: Arc<dyn ProducerLauncher>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            channel,
            store,
            launcher,
            settings,
        }
    }

    /// Connects, serves control events and reconnects after a session drop
    /// until `shutdown` resolves. Failing to (re)connect within the policy is
    /// fatal.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        // 首次连接失败则不启动状态机
        let mut conn = tokio::select! {
            conn = self.channel.connect() => conn?,
            () = &mut shutdown => {
                info!("Shutdown requested before connecting");
                return Ok(());
            }
        };

        let (supervisor, task) = StreamSupervisor::spawn(
            self.channel.client_id(),
            self.store.clone(),
            self.launcher.clone(),
            Arc::new(self.channel.clone()),
            self.settings.clone(),
        );
        let handler = Arc::new(supervisor.clone());
        info!("✅ Device client ready");

        let result = loop {
            tokio::select! {
                reason = self.channel.serve(&conn, handler.clone()) => {
                    warn!("⚠️  Session dropped: {}", reason);
                    match self.recover(&supervisor, &mut shutdown).await {
                        Some(Ok(next)) => conn = next,
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    }
                }
                () = &mut shutdown => {
                    info!("Shutdown requested (stream {:?})", supervisor.state());
                    break Ok(());
                }
            }
        };

        supervisor.shutdown().await;
        if let Err(e) = task.await {
            warn!("⚠️  Supervisor task ended abnormally: {}", e);
        }
        self.channel.close();
        result
    }

    /// Stops any active stream, then reconnects. `None` means shutdown was
    /// requested while reconnecting.
    async fn recover<S>(
        &self,
        supervisor: &SupervisorHandle,
        shutdown: &mut std::pin::Pin<&mut S>,
    ) -> Option<Result<Connection>>
    where
        S: Future<Output = ()>,
    {
        match supervisor.stop().await {
            Ok(None) => {}
            Ok(Some(RelayEnd::Drained(stats))) => {
                info!("Stream stopped after {} forwarded frames", stats.forwarded)
            }
            Ok(Some(end)) => warn!("⚠️  Stream stopped without draining: {:?}", end),
            Err(e) => warn!("⚠️  Implicit stop failed: {}", e),
        }

        info!("Reconnecting...");
        tokio::select! {
            conn = self.channel.connect() => {
                match &conn {
                    Ok(_) => info!("✓ Reconnected"),
                    Err(e) => error!("✗ Reconnection failed: {}", e),
                }
                Some(conn)
            }
            () = shutdown.as_mut() => None,
        }
    }
}
