// QUIC 流上的消息收发
//
// One message per stream: fire-and-forget events travel on a unidirectional
// stream, calls on a bidirectional stream whose reply is read to the end. An
// empty reply means the peer had nothing to answer.

use crate::error::{RelayError, Result};
use crate::protocol::{ControlEvent, ControlResponse};
use crate::types::{MessageType, ProtocolMessage};
use quinn::{Connection, RecvStream, SendStream};
use std::time::Duration;

pub const CONTROL_MESSAGE_LIMIT: usize = 64 * 1024;
pub const FRAME_MESSAGE_LIMIT: usize = 16 * 1024 * 1024;

pub(crate) fn quic_err(e: impl std::fmt::Display) -> RelayError {
    RelayError::QuicError(e.to_string())
}

/// Sends one message on its own unidirectional stream. Returns once the peer
/// has acknowledged the stream, so a slow link slows the caller down.
pub async fn send_message(conn: &Connection, message: &ProtocolMessage) -> Result<()> {
    let data = message.to_bytes()?;
    let mut stream = conn.open_uni().await.map_err(quic_err)?;
    stream.write_all(&data).await.map_err(quic_err)?;
    stream.finish().await.map_err(quic_err)?;
    Ok(())
}

/// Request/response over a bidirectional stream, bounded by `timeout`.
pub async fn call(
    conn: &Connection,
    message: &ProtocolMessage,
    timeout: Duration,
) -> Result<Option<ProtocolMessage>> {
    let data = message.to_bytes()?;
    let exchange = async {
        let (mut send, mut recv) = conn.open_bi().await.map_err(quic_err)?;
        send.write_all(&data).await.map_err(quic_err)?;
        send.finish().await.map_err(quic_err)?;

        let buf = recv
            .read_to_end(CONTROL_MESSAGE_LIMIT)
            .await
            .map_err(quic_err)?;
        if buf.is_empty() {
            Ok(None)
        } else {
            ProtocolMessage::from_bytes(&buf).map(Some)
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| RelayError::CallTimeout(timeout))?
}

/// Sends a control event as a call and decodes the control response.
pub async fn call_control(
    conn: &Connection,
    event: &ControlEvent,
    sequence_number: u64,
    timeout: Duration,
) -> Result<ControlResponse> {
    let request = ProtocolMessage::new(MessageType::Control, event, sequence_number)?;
    match call(conn, &request, timeout).await? {
        Some(reply) if reply.message_type == MessageType::ControlResponse => reply.decode_payload(),
        Some(reply) => Err(RelayError::ProtocolError(format!(
            "unexpected reply to '{}': {:?}",
            event.action(),
            reply.message_type
        ))),
        None => Err(RelayError::ProtocolError(format!(
            "no reply to '{}'",
            event.action()
        ))),
    }
}

pub async fn read_message(recv: &mut RecvStream, limit: usize) -> Result<ProtocolMessage> {
    let buf = recv.read_to_end(limit).await.map_err(quic_err)?;
    ProtocolMessage::from_bytes(&buf)
}

/// Answers a call. `None` finishes the stream with an empty body.
pub async fn reply(send: &mut SendStream, message: Option<&ProtocolMessage>) -> Result<()> {
    if let Some(message) = message {
        let data = message.to_bytes()?;
        send.write_all(&data).await.map_err(quic_err)?;
    }
    send.finish().await.map_err(quic_err)?;
    Ok(())
}
