//! Frame codec for the duplex chat channel.
//!
//! Inbound frames are JSON objects tagged by `type`. Unknown tags decode to
//! [`InboundFrame::Unknown`] and are skipped, so newer servers can add frame
//! kinds without breaking older clients.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ChatError;
use crate::models::{Message, SessionId};

const DEFAULT_ERROR_TEXT: &str = "An error occurred";

/// Raw inbound wire frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Chunk {
        #[serde(default)]
        content: String,
    },
    Done {
        message: Message,
    },
    UserMessage {
        message: Message,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Typed event produced by the codec for one session's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Chunk(String),
    Done(Message),
    UserMessageAck(Message),
    Error {
        message: String,
        code: Option<String>,
    },
}

/// Outbound user message, addressed to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub session_id: SessionId,
    pub content: String,
}

#[derive(Serialize)]
struct WireOutbound<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a str,
}

impl OutboundFrame {
    pub fn new(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            session_id,
            content: content.into(),
        }
    }
}

/// Serialize an outbound frame. The session id is implied by the channel.
pub fn encode(frame: &OutboundFrame) -> Result<String, ChatError> {
    serde_json::to_string(&WireOutbound {
        kind: "message",
        content: &frame.content,
    })
    .map_err(|e| ChatError::ProtocolViolation(e.to_string()))
}

/// Decode one text frame received on `session_id`'s channel.
///
/// `Ok(None)` means the frame was well formed but of a kind this client does
/// not know; it has already been logged.
pub fn decode(session_id: SessionId, text: &str) -> Result<Option<InboundEvent>, ChatError> {
    let frame: InboundFrame = serde_json::from_str(text).map_err(|e| {
        ChatError::ProtocolViolation(format!("malformed frame: {e}"))
    })?;

    let event = match frame {
        InboundFrame::Chunk { content } => InboundEvent::Chunk(content),
        InboundFrame::Done { message } => InboundEvent::Done(scoped(message, session_id)),
        InboundFrame::UserMessage { message } => {
            InboundEvent::UserMessageAck(scoped(message, session_id))
        }
        InboundFrame::Error {
            message,
            code,
            content,
        } => InboundEvent::Error {
            message: message
                .filter(|m| !m.is_empty())
                .or_else(|| content.filter(|c| !c.is_empty()))
                .unwrap_or_else(|| DEFAULT_ERROR_TEXT.to_string()),
            code,
        },
        InboundFrame::Unknown => {
            warn!(session_id = %session_id, frame = %text, "unknown frame type, skipping");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn scoped(mut message: Message, session_id: SessionId) -> Message {
    match message.session_id {
        Some(id) if id != session_id => {
            warn!(
                channel = %session_id,
                claimed = %id,
                "frame names a different session than its channel, using channel scope"
            );
            message.session_id = Some(session_id);
        }
        Some(_) => {}
        None => message.session_id = Some(session_id),
    }
    message
}
