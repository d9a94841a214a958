use crate::stream::FrameSink;
use async_trait::async_trait;
use common::transport::SERVER_NAME;
use common::wire::{self, CONTROL_MESSAGE_LIMIT};
use common::{
    ControlEvent, ControlResponse, FramePayload, MessageType, ProtocolMessage, RegisterRequest,
    RelayError, Result, UNKNOWN_CONTROL_EVENT_MESSAGE,
};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded retry with linearly increasing delay (`delay × attempt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Runs `connect` until it succeeds or the policy is exhausted. Exhaustion is
/// a `ConnectionError`.
pub async fn connect_with_retry<F, Fut, T>(policy: &ReconnectPolicy, mut connect: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = String::from("no attempts made");
    for attempt in 1..=policy.attempts {
        match connect(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                if attempt == policy.attempts {
                    break;
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "✗ Connection attempt {}/{} failed: {}, retrying in {:?}",
                    attempt, policy.attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(RelayError::ConnectionError(format!(
        "gave up after {} attempts: {}",
        policy.attempts, last_error
    )))
}

/// Receiver of control events dispatched by the channel. Returning `Some`
/// answers the caller on the same stream.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_event(&self, event: ControlEvent) -> Option<ControlResponse>;
}

/// 控制通道
///
/// One logical session with the server. Cheap to clone; every clone talks
/// over whichever connection is current.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    server_addr: SocketAddr,
    client_id: String,
    policy: ReconnectPolicy,
    connection: Mutex<Option<Connection>>,
    sequence: AtomicU64,
}

impl ControlChannel {
    pub fn new(
        endpoint: Endpoint,
        server_addr: SocketAddr,
        client_id: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                server_addr,
                client_id: client_id.into(),
                policy,
                connection: Mutex::new(None),
                sequence: AtomicU64::new(1),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Connects under the reconnect policy and registers the client id.
    pub async fn connect(&self) -> Result<Connection> {
        let conn = connect_with_retry(&self.inner.policy, |attempt| self.connect_once(attempt)).await?;
        self.set_connection(Some(conn.clone()));
        Ok(conn)
    }

    async fn connect_once(&self, attempt: u32) -> Result<Connection> {
        debug!(
            "Connecting to {} (attempt {})",
            self.inner.server_addr, attempt
        );
        let conn = self
            .inner
            .endpoint
            .connect(self.inner.server_addr, SERVER_NAME)
            .map_err(|e| RelayError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| RelayError::ConnectionError(e.to_string()))?;

        let register = RegisterRequest {
            client_id: self.inner.client_id.clone(),
        };
        let message = ProtocolMessage::new(MessageType::Register, &register, self.next_sequence())?;
        wire::send_message(&conn, &message).await?;

        info!(
            "✓ Connected to {} as '{}'",
            self.inner.server_addr, self.inner.client_id
        );
        Ok(conn)
    }

    fn set_connection(&self, conn: Option<Connection>) {
        if let Ok(mut current) = self.inner.connection.lock() {
            *current = conn;
        }
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Result<Connection> {
        self.inner
            .connection
            .lock()
            .ok()
            .and_then(|current| current.as_ref().cloned())
            .filter(|conn| conn.close_reason().is_none())
            .ok_or_else(|| RelayError::ConnectionError("Not connected".to_string()))
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire-and-forget event.
    pub async fn send<T: Serialize>(&self, message_type: MessageType, body: &T) -> Result<()> {
        let conn = self.connection()?;
        let message = ProtocolMessage::new(message_type, body, self.next_sequence())?;
        wire::send_message(&conn, &message).await
    }

    /// Control event that expects an answer within `timeout`.
    pub async fn call(&self, event: &ControlEvent, timeout: Duration) -> Result<ControlResponse> {
        let conn = self.connection()?;
        wire::call_control(&conn, event, self.next_sequence(), timeout).await
    }

    /// Serves inbound streams on `conn` until it closes. Returns the reason.
    ///
    /// Bidirectional streams are calls and are handled concurrently.
    /// Unidirectional streams are handled in arrival order so that a `start`
    /// followed by a `stop` reaches the handler in that order.
    pub async fn serve<H: EventHandler>(&self, conn: &Connection, handler: Arc<H>) -> RelayError {
        loop {
            tokio::select! {
                bi = conn.accept_bi() => match bi {
                    Ok((send, recv)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_call(send, recv, handler).await {
                                warn!("⚠️  Control call failed: {}", e);
                            }
                        });
                    }
                    Err(e) => return RelayError::ConnectionError(e.to_string()),
                },
                uni = conn.accept_uni() => match uni {
                    Ok(recv) => {
                        if let Err(e) = handle_event(recv, handler.as_ref()).await {
                            warn!("⚠️  Control event rejected: {}", e);
                        }
                    }
                    Err(e) => return RelayError::ConnectionError(e.to_string()),
                },
            }
        }
    }

    pub fn close(&self) {
        if let Ok(mut current) = self.inner.connection.lock() {
            if let Some(conn) = current.take() {
                conn.close(0u32.into(), b"client shutdown");
            }
        }
    }
}

async fn read_control(recv: &mut RecvStream) -> Result<(ControlEvent, u64)> {
    let message = wire::read_message(recv, CONTROL_MESSAGE_LIMIT).await?;
    if message.message_type != MessageType::Control {
        return Err(RelayError::ProtocolError(format!(
            "unexpected message type {:?}",
            message.message_type
        )));
    }
    Ok((ControlEvent::parse(&message.payload)?, message.sequence_number))
}

async fn handle_call<H: EventHandler>(
    mut send: SendStream,
    mut recv: RecvStream,
    handler: Arc<H>,
) -> Result<()> {
    let (response, sequence) = match read_control(&mut recv).await {
        Ok((event, sequence)) => {
            debug!("Control call: {}", event.action());
            (handler.on_event(event).await, sequence)
        }
        Err(e) => {
            error!("✗ {}", e);
            (Some(ControlResponse::error(UNKNOWN_CONTROL_EVENT_MESSAGE)), 0)
        }
    };

    let reply = match response {
        Some(response) => Some(ProtocolMessage::new(
            MessageType::ControlResponse,
            &response,
            sequence,
        )?),
        None => None,
    };
    wire::reply(&mut send, reply.as_ref()).await
}

async fn handle_event<H: EventHandler>(mut recv: RecvStream, handler: &H) -> Result<()> {
    let (event, _) = read_control(&mut recv).await?;
    debug!("Control event: {}", event.action());
    let expects_response = event.expects_response();
    if let Some(response) = handler.on_event(event).await {
        if expects_response {
            warn!("⚠️  No reply stream for {:?}, sender should call instead", response);
        } else {
            debug!("Dropping response to fire-and-forget event: {:?}", response);
        }
    }
    Ok(())
}

#[async_trait]
impl FrameSink for ControlChannel {
    async fn forward(&self, frame: FramePayload) -> Result<()> {
        self.send(MessageType::Frame, &frame).await
    }
}
