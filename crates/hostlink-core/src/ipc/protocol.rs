//! Wire format shared by both sides of a channel.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! `Message` envelope:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Message type tags are `(block << 16) | index`, so subsystems defining
//! messages in different blocks cannot collide.

use crate::config::IpcConfig;
use crate::routing::RoutingId;
use crate::{LinkError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Message type blocks.
pub mod block {
    /// Channel bookkeeping (hello). Never surfaced to peers.
    pub const INTERNAL: u16 = 0;
    /// Control messages handled by the peers themselves.
    pub const CONTROL: u16 = 1;
    /// Profile lifecycle and configuration messages.
    pub const PROFILE: u16 = 2;
}

/// Build a message type tag from a block and an index within it.
pub const fn message_type(block: u16, index: u16) -> u32 {
    ((block as u32) << 16) | index as u32
}

/// Block a type tag belongs to.
pub const fn block_of(type_id: u32) -> u16 {
    (type_id >> 16) as u16
}

/// Type of the hello frame each side sends first.
pub const HELLO_TYPE: u32 = message_type(block::INTERNAL, 1);

/// Message-level protocol violations. None of them closes the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown message type {type_id:#x}")]
    UnknownType { type_id: u32 },

    #[error("malformed payload for message type {type_id:#x}: {reason}")]
    Malformed { type_id: u32, reason: String },

    #[error("unexpected reply for request {request_id}")]
    UnexpectedReply { request_id: u64 },
}

/// One message as carried over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub routing_id: RoutingId,
    pub type_id: u32,
    /// Sender waits for exactly one reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reply: bool,
    /// Reply reports that the request could not be handled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reply_error: bool,
    /// Correlates a sync request with its reply. Assigned by the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Create an asynchronous message with an empty payload.
    pub fn new(routing_id: RoutingId, type_id: u32) -> Self {
        Self {
            routing_id,
            type_id,
            sync: false,
            reply: false,
            reply_error: false,
            request_id: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Create a control message (addressed to the peer itself).
    pub fn control(type_id: u32) -> Self {
        Self::new(RoutingId::CONTROL, type_id)
    }

    /// Attach a serialized payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Mark the message as synchronous.
    pub fn into_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn is_control(&self) -> bool {
        self.routing_id.is_control()
    }

    /// Decode the payload into `T`, reporting a malformed payload on failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::Malformed {
            type_id: self.type_id,
            reason: e.to_string(),
        })
    }

    /// Build the successful reply to this sync message.
    pub fn reply_with(&self, payload: serde_json::Value) -> Message {
        Message {
            routing_id: self.routing_id,
            type_id: self.type_id,
            sync: false,
            reply: true,
            reply_error: false,
            request_id: self.request_id,
            payload,
        }
    }

    /// Build the error reply to this sync message.
    pub fn error_reply(&self) -> Message {
        Message {
            reply_error: true,
            ..self.reply_with(serde_json::Value::Null)
        }
    }
}

/// Payload of the hello frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u16,
    pub pid: u32,
    pub channel_id: String,
}

impl Hello {
    pub fn for_channel(channel_id: &str) -> Self {
        Self {
            protocol_version: IpcConfig::PROTOCOL_VERSION,
            pid: std::process::id(),
            channel_id: channel_id.to_string(),
        }
    }

    pub fn into_message(self) -> Result<Message> {
        Message::new(RoutingId::CONTROL, HELLO_TYPE).with_payload(&self)
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(LinkError::Io {
            message: format!(
                "IPC frame size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_MESSAGE_SIZE
            ),
            source: None,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a message and write it as one frame.
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}
