use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// 协议消息
///
/// The envelope is bincode on the wire; `payload` carries the JSON body of the
/// event so that its shape matches what UI clients see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub sequence_number: u64,
    pub timestamp: SystemTime,
}

impl ProtocolMessage {
    pub fn new<T: Serialize>(message_type: MessageType, body: &T, sequence_number: u64) -> Result<Self> {
        Ok(Self {
            message_type,
            payload: serde_json::to_vec(body)?,
            sequence_number,
            timestamp: SystemTime::now(),
        })
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Register = 0x01,
    Control = 0x02,
    ControlResponse = 0x03,
    Frame = 0x04,
}

/// One annotated camera frame, as forwarded to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    /// `data:image/jpeg;base64,...`
    pub image: String,
    /// Post-processor output serialized as JSON.
    pub detections: String,
    pub width: u32,
    pub height: u32,
}

pub const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";
