// 推流状态机
//
// The supervisor is a single task that owns the device session. Lifecycle
// commands reach it over an mpsc channel, so they are applied one at a time
// and in the order the server sent them. The selected model is also published
// on a watch channel; `get_selected` reads it without queueing behind a
// teardown.

use crate::quic::EventHandler;
use crate::stream::{
    FrameQueue, FrameSink, ProducerExit, ProducerHandle, ProducerLauncher, RelayPump, RelayStats,
};
use async_trait::async_trait;
use common::model::{resolve_model, ModelStore};
use common::{ControlEvent, ControlResponse, RelayError, Result, MODEL_NOT_FOUND_MESSAGE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
}

/// How the relay pump of a torn-down stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The pump reached the end-of-stream marker.
    Drained(RelayStats),
    /// The pump was still running at the deadline and got aborted.
    Aborted,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub queue_capacity: usize,
    pub teardown_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            teardown_timeout: Duration::from_secs(2),
        }
    }
}

enum Command {
    Start { ack: Option<oneshot::Sender<Result<()>>> },
    Stop { ack: Option<oneshot::Sender<Option<RelayEnd>>> },
    Select { network: String, reply: oneshot::Sender<ControlResponse> },
    Shutdown { ack: oneshot::Sender<()> },
}

struct ActiveStream {
    model: String,
    producer: Box<dyn ProducerHandle>,
    relay: JoinHandle<RelayStats>,
    queue: FrameQueue,
}

/// 设备会话
pub struct DeviceSession {
    client_id: String,
    selected: watch::Sender<Option<String>>,
    state: watch::Sender<StreamState>,
    active: Option<ActiveStream>,
}

impl DeviceSession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn selected_model(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }
}

/// Cloneable front of the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    selected: watch::Receiver<Option<String>>,
    state: watch::Receiver<StreamState>,
}

impl SupervisorHandle {
    /// Starts (or restarts) streaming and waits for the outcome.
    pub async fn start(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Start { ack: Some(ack) }).await?;
        done.await.map_err(|_| stopped())?
    }

    /// Stops streaming and waits until teardown has finished. Returns how the
    /// relay ended, or `None` when nothing was streaming.
    pub async fn stop(&self) -> Result<Option<RelayEnd>> {
        let (ack, done) = oneshot::channel();
        self.command(Command::Stop { ack: Some(ack) }).await?;
        done.await.map_err(|_| stopped())
    }

    pub async fn select(&self, network: impl Into<String>) -> Result<ControlResponse> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Select {
            network: network.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| stopped())
    }

    pub fn selected_model(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Tears down any active stream and ends the supervisor task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.command(Command::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> RelayError {
    RelayError::ProtocolError("stream supervisor has stopped".to_string())
}

#[async_trait]
impl EventHandler for SupervisorHandle {
    async fn on_event(&self, event: ControlEvent) -> Option<ControlResponse> {
        match event {
            ControlEvent::Start => {
                if let Err(e) = self.command(Command::Start { ack: None }).await {
                    error!("✗ Start dropped: {}", e);
                }
                None
            }
            ControlEvent::Stop => {
                if let Err(e) = self.command(Command::Stop { ack: None }).await {
                    error!("✗ Stop dropped: {}", e);
                }
                None
            }
            ControlEvent::Select { network } => Some(
                self.select(network)
                    .await
                    .unwrap_or_else(|e| ControlResponse::error(e.to_string())),
            ),
            ControlEvent::GetSelected => {
                let selected = self.selected_model();
                debug!("Getting selected model: {:?}", selected);
                Some(ControlResponse::selected(selected))
            }
        }
    }
}

enum Next {
    Command(Option<Command>),
    Exited(Result<ProducerExit>),
}

pub struct StreamSupervisor {
    session: DeviceSession,
    store: Arc<dyn ModelStore>,
    launcher: Arc<dyn ProducerLauncher>,
    sink: Arc<dyn FrameSink>,
    settings: SupervisorSettings,
    commands: mpsc::Receiver<Command>,
}

impl StreamSupervisor {
    pub fn spawn(
        client_id: impl Into<String>,
        store: Arc<dyn ModelStore>,
        launcher: Arc<dyn ProducerLauncher>,
        sink: Arc<dyn FrameSink>,
        settings: SupervisorSettings,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (selected_tx, selected_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);

        let supervisor = Self {
            session: DeviceSession {
                client_id: client_id.into(),
                selected: selected_tx,
                state: state_tx,
                active: None,
            },
            store,
            launcher,
            sink,
            settings,
            commands: commands_rx,
        };
        let task = tokio::spawn(supervisor.run());

        let handle = SupervisorHandle {
            commands: commands_tx,
            selected: selected_rx,
            state: state_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!("✓ Stream supervisor ready for '{}'", self.session.client_id());

        loop {
            let next = tokio::select! {
                command = self.commands.recv() => Next::Command(command),
                exit = wait_for_exit(&mut self.session.active) => Next::Exited(exit),
            };

            match next {
                Next::Command(Some(Command::Shutdown { ack })) => {
                    self.teardown().await;
                    let _ = ack.send(());
                    break;
                }
                Next::Command(Some(command)) => self.handle(command).await,
                Next::Command(None) => {
                    self.teardown().await;
                    break;
                }
                Next::Exited(exit) => {
                    match exit {
                        Ok(exit) => warn!("⚠️  Producer exited on its own (code {:?})", exit.code),
                        Err(e) => warn!("⚠️  Lost track of producer: {}", e),
                    }
                    self.teardown().await;
                }
            }
        }

        info!("Stream supervisor stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { ack } => {
                let result = self.start().await;
                if let Err(e) = &result {
                    error!("✗ Failed to start stream: {}", e);
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            Command::Stop { ack } => {
                let end = self.stop().await;
                if let Some(ack) = ack {
                    let _ = ack.send(end);
                }
            }
            Command::Select { network, reply } => {
                let response = self.select(network).await;
                let _ = reply.send(response);
            }
            Command::Shutdown { ack } => {
                self.teardown().await;
                let _ = ack.send(());
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let Some(model) = self.session.selected_model() else {
            return Err(RelayError::ProducerSpawnFailure(
                "No model selected".to_string(),
            ));
        };

        if self.session.active.is_some() {
            info!("Stream is already running, restarting");
            self.teardown().await;
        }

        let store = self.store.clone();
        let name = model.clone();
        tokio::task::spawn_blocking(move || resolve_model(store.as_ref(), &name))
            .await
            .map_err(|e| RelayError::ProducerSpawnFailure(e.to_string()))?
            .map_err(|e| RelayError::ProducerSpawnFailure(e.to_string()))?;

        let queue = FrameQueue::new(self.settings.queue_capacity);
        let producer = self.launcher.launch(&model, queue.clone()).await?;
        let relay = tokio::spawn(RelayPump::new(queue.clone(), self.sink.clone()).run());

        info!(
            "▶️  Streaming '{}' (producer {:?}, queue of {})",
            model,
            producer.id(),
            queue.capacity()
        );
        self.session.active = Some(ActiveStream {
            model,
            producer,
            relay,
            queue,
        });
        self.session.set_state(StreamState::Streaming);
        Ok(())
    }

    async fn stop(&mut self) -> Option<RelayEnd> {
        if self.session.active.is_none() {
            info!("Stream not running.");
            return None;
        }
        info!("⏹️  Stopping stream");
        self.teardown().await
    }

    /// Kill the producer, end the stream, wait for the relay pump, then drop
    /// whatever is still queued. Every step is bounded.
    async fn teardown(&mut self) -> Option<RelayEnd> {
        let mut stream = self.session.active.take()?;
        let timeout = self.settings.teardown_timeout;

        stream.producer.terminate(timeout).await;

        if !stream.queue.end_stream(timeout).await {
            warn!("⚠️  Frame queue still full, end-of-stream marker not delivered");
        }

        let end = match tokio::time::timeout(timeout, &mut stream.relay).await {
            Ok(Ok(stats)) => {
                debug!(
                    "Relay for '{}' finished: {} forwarded, {} dropped",
                    stream.model, stats.forwarded, stats.failed
                );
                RelayEnd::Drained(stats)
            }
            Ok(Err(e)) => {
                warn!("⚠️  Relay task failed: {}", e);
                RelayEnd::Failed
            }
            Err(_) => {
                warn!("⚠️  Relay did not finish within {:?}, aborting", timeout);
                stream.relay.abort();
                RelayEnd::Aborted
            }
        };

        let dropped = stream.queue.drain().await;
        if dropped > 0 {
            debug!("Discarded {} queued frames", dropped);
        }

        self.session.set_state(StreamState::Idle);
        info!("✓ Stream for '{}' torn down", stream.model);
        Some(end)
    }

    async fn select(&mut self, network: String) -> ControlResponse {
        let store = self.store.clone();
        let name = network.clone();
        let resolved = tokio::task::spawn_blocking(move || resolve_model(store.as_ref(), &name)).await;

        match resolved {
            Ok(Ok(_)) => {
                info!("✓ Selected model '{}'", network);
                self.session.selected.send_replace(Some(network.clone()));
                ControlResponse::selected(Some(network))
            }
            Ok(Err(RelayError::ModelNotFound(_))) => {
                warn!("⚠️  Model '{}' not found", network);
                ControlResponse::error(MODEL_NOT_FOUND_MESSAGE)
            }
            Ok(Err(e)) => {
                warn!("⚠️  Cannot select '{}': {}", network, e);
                ControlResponse::error(e.to_string())
            }
            Err(e) => ControlResponse::error(format!("Model lookup failed: {}", e)),
        }
    }
}

/// Pending forever while idle.
async fn wait_for_exit(active: &mut Option<ActiveStream>) -> Result<ProducerExit> {
    match active {
        Some(stream) => stream.producer.wait().await,
        None => std::future::pending().await,
    }
}
