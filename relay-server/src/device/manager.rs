use common::wire;
use common::{ControlEvent, ControlResponse, MessageType, ProtocolMessage, RelayError, Result};
use dashmap::DashMap;
use quinn::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Messages waiting to be forwarded to one peer.
pub const PEER_OUTBOX_CAPACITY: usize = 32;

pub type Outbox = mpsc::Receiver<Arc<ProtocolMessage>>;

struct Peer {
    connection: Connection,
    outbox: mpsc::Sender<Arc<ProtocolMessage>>,
}

/// 已连接客户端注册表
///
/// Every QUIC connection is a session. A client id maps to the session that
/// registered it last; removing a session only drops the ids that still point
/// at it.
#[derive(Clone, Default)]
pub struct DeviceManager {
    clients: Arc<DashMap<String, Uuid>>,
    connections: Arc<DashMap<Uuid, Peer>>,
    sequence: Arc<AtomicU64>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存会话连接
    ///
    /// Returns the receiving end of the session's outbox. Whoever holds it
    /// forwards relayed messages to the peer; dropping it makes relays to
    /// this session fail fast.
    pub fn add_connection(&self, session_id: Uuid, connection: Connection) -> Outbox {
        let (outbox, receiver) = mpsc::channel(PEER_OUTBOX_CAPACITY);
        self.connections.insert(session_id, Peer { connection, outbox });
        receiver
    }

    /// 注册客户端，返回被替换的旧会话
    pub fn register(&self, client_id: &str, session_id: Uuid) -> Option<Uuid> {
        let previous = self.clients.insert(client_id.to_string(), session_id);
        match previous {
            Some(old) if old != session_id => {
                info!("Client {} moved from session {} to {}", client_id, old, session_id)
            }
            _ => info!("✓ Registered client {} with session {}", client_id, session_id),
        }
        previous.filter(|old| *old != session_id)
    }

    /// 移除会话，返回随之注销的客户端
    pub fn remove_session(&self, session_id: &Uuid) -> Vec<String> {
        self.connections.remove(session_id);

        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|entry| entry.value() == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|client_id| {
                self.clients
                    .remove_if(client_id, |_, current| current == session_id)
                    .is_some()
            })
            .inspect(|client_id| info!("Client {} disconnected", client_id))
            .collect()
    }

    pub fn session_of(&self, client_id: &str) -> Option<Uuid> {
        self.clients.get(client_id).map(|entry| *entry.value())
    }

    pub fn connection_of(&self, client_id: &str) -> Result<Connection> {
        self.session_of(client_id)
            .and_then(|session| {
                self.connections
                    .get(&session)
                    .map(|peer| peer.connection.clone())
            })
            .ok_or_else(|| RelayError::ClientNotFound(client_id.to_string()))
    }

    /// Queues `message` for every session except `session_id` without
    /// waiting. Returns how many peers had a full or closed outbox and
    /// missed it.
    pub fn relay_from(&self, session_id: &Uuid, message: Arc<ProtocolMessage>) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.key() != session_id)
            .filter(|entry| entry.value().outbox.try_send(message.clone()).is_err())
            .count()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.connections.len()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Control event that expects an answer from `client_id` within `timeout`.
    pub async fn call(
        &self,
        client_id: &str,
        event: &ControlEvent,
        timeout: Duration,
    ) -> Result<ControlResponse> {
        let connection = self.connection_of(client_id)?;
        debug!("Calling '{}' on {}", event.action(), client_id);
        wire::call_control(&connection, event, self.next_sequence(), timeout).await
    }

    /// Fire-and-forget control event.
    pub async fn send(&self, client_id: &str, event: &ControlEvent) -> Result<()> {
        let connection = self.connection_of(client_id)?;
        let message = ProtocolMessage::new(MessageType::Control, event, self.next_sequence())?;
        debug!("Sending '{}' to {}", event.action(), client_id);
        wire::send_message(&connection, &message).await
    }
}
