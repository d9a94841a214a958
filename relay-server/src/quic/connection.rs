use crate::device::{DeviceManager, Outbox};
use crate::distribution::FrameHub;
use common::wire::{self, CONTROL_MESSAGE_LIMIT, FRAME_MESSAGE_LIMIT};
use common::{FramePayload, MessageType, ProtocolMessage, RegisterRequest, Result};
use quinn::{Connection, RecvStream, SendStream};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Serves one peer until its connection closes. Unidirectional streams are
/// handled in arrival order; calls on bidirectional streams run concurrently.
pub async fn handle_connection(connection: Connection, device_manager: DeviceManager, frame_hub: FrameHub) {
    let session_id = Uuid::new_v4();
    info!("Handling connection with session: {}", session_id);
    let outbox = device_manager.add_connection(session_id, connection.clone());

    // 转发其他会话的消息
    let forwarder = tokio::spawn(forward_outbox(connection.clone(), outbox, session_id));

    // 处理双向流（调用）
    let calls = tokio::spawn(handle_bi_streams(
        connection.clone(),
        device_manager.clone(),
        session_id,
    ));

    // 处理单向流（注册、控制、帧）
    handle_uni_streams(&connection, &device_manager, &frame_hub, session_id).await;

    calls.abort();
    forwarder.abort();
    let removed = device_manager.remove_session(&session_id);
    info!(
        "⏹️  Session {} closed ({} client(s) unregistered)",
        session_id,
        removed.len()
    );
}

async fn handle_uni_streams(
    connection: &Connection,
    device_manager: &DeviceManager,
    frame_hub: &FrameHub,
    session_id: Uuid,
) {
    loop {
        let mut recv = match connection.accept_uni().await {
            Ok(recv) => recv,
            Err(e) => {
                debug!("Session {} stopped accepting streams: {}", session_id, e);
                break;
            }
        };

        let message = match wire::read_message(&mut recv, FRAME_MESSAGE_LIMIT).await {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️  Dropping unreadable message from {}: {}", session_id, e);
                continue;
            }
        };

        if let Err(e) = dispatch(message, device_manager, frame_hub, session_id) {
            warn!("⚠️  Failed to handle message from {}: {}", session_id, e);
        }
    }
}

/// Never waits on another peer: frames reach the hub first and relays only
/// queue into each peer's outbox.
fn dispatch(
    message: ProtocolMessage,
    device_manager: &DeviceManager,
    frame_hub: &FrameHub,
    session_id: Uuid,
) -> Result<()> {
    match message.message_type {
        MessageType::Register => {
            let register: RegisterRequest = message.decode_payload()?;
            device_manager.register(&register.client_id, session_id);
        }
        MessageType::Control => {
            relay_to_peers(device_manager, session_id, message);
        }
        MessageType::Frame => {
            let frame: FramePayload = message.decode_payload()?;
            frame_hub.publish(frame);
            relay_to_peers(device_manager, session_id, message);
        }
        MessageType::ControlResponse => {
            debug!("Ignoring unsolicited control response from {}", session_id);
        }
    }
    Ok(())
}

async fn handle_bi_streams(connection: Connection, device_manager: DeviceManager, session_id: Uuid) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let device_manager = device_manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_call(send, recv, &device_manager, session_id).await {
                        error!("Call from {} failed: {}", session_id, e);
                    }
                });
            }
            Err(e) => {
                debug!("Session {} stopped accepting calls: {}", session_id, e);
                break;
            }
        }
    }
}

/// Calls are relayed like plain control events; the caller gets an empty
/// reply since no single peer owns the answer.
async fn handle_call(
    mut send: SendStream,
    mut recv: RecvStream,
    device_manager: &DeviceManager,
    session_id: Uuid,
) -> Result<()> {
    let message = wire::read_message(&mut recv, CONTROL_MESSAGE_LIMIT).await?;
    if message.message_type == MessageType::Control {
        relay_to_peers(device_manager, session_id, message);
    } else {
        debug!("Unhandled call type: {:?}", message.message_type);
    }
    wire::reply(&mut send, None).await
}

fn relay_to_peers(device_manager: &DeviceManager, session_id: Uuid, message: ProtocolMessage) {
    let message_type = message.message_type;
    let dropped = device_manager.relay_from(&session_id, Arc::new(message));
    if dropped > 0 {
        trace!(
            "Dropped {:?} from {} for {} slow peer(s)",
            message_type,
            session_id,
            dropped
        );
    }
}

/// Writes queued messages to one peer. Only this task waits on the peer's
/// stream credit, so a peer that stops reading just loses messages.
async fn forward_outbox(connection: Connection, mut outbox: Outbox, session_id: Uuid) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = wire::send_message(&connection, &message).await {
            if connection.close_reason().is_some() {
                break;
            }
            debug!("Failed to forward {:?} to {}: {}", message.message_type, session_id, e);
        }
    }
    debug!("Forwarder for session {} finished", session_id);
}
