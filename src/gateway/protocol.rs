//! Gateway wire format: opcodes, payload envelopes and message decoding.
//!
//! The same message object arrives inside `MESSAGE_CREATE` dispatches and
//! in REST responses, so [`MessagePayload`] is shared with the channel
//! poller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::pipeline::types::{Attachment, Author, InboundEvent, ReferencedEvent};

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// Close code sent for invalid credentials.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;

/// Envelope of every gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(format!("bad frame: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Milliseconds.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

pub fn identify(token: &str, intents: u64) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "signal-watch",
                "device": "signal-watch",
            },
        },
    })
}

pub fn resume(token: &str, session_id: &str, seq: u64) -> Value {
    json!({
        "op": OP_RESUME,
        "d": { "token": token, "session_id": session_id, "seq": seq },
    })
}

pub fn heartbeat(seq: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": seq })
}

/// Close codes after which reconnecting cannot succeed.
pub fn is_fatal_close(code: u16) -> bool {
    code == CLOSE_AUTHENTICATION_FAILED || (4010..=4014).contains(&code)
}

/// Close codes that invalidate the session, so the next connect must
/// identify from scratch.
pub fn invalidates_session(code: u16) -> bool {
    matches!(code, 4007 | 4009)
}

/// Map a close frame to the error ending the session.
pub fn close_error(code: Option<u16>, reason: &str) -> GatewayError {
    match code {
        Some(code) if is_fatal_close(code) => {
            GatewayError::AuthFailed(format!("close code {code}: {reason}"))
        }
        _ => GatewayError::Closed {
            code,
            reason: reason.to_string(),
        },
    }
}

// ── Message object ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    pub channel_id: String,
    pub author: AuthorPayload,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub referenced_message: Option<Box<ReferencedPayload>>,
    #[serde(default)]
    pub message_reference: Option<MessageReference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorPayload {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentPayload {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferencedPayload {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageReference {
    #[serde(default)]
    pub message_id: Option<String>,
}

impl MessagePayload {
    pub fn into_event(self) -> InboundEvent {
        let referenced_event = match (self.referenced_message, self.message_reference) {
            (Some(r), _) => Some(ReferencedEvent {
                id: r.id,
                content: r.content.filter(|c| !c.is_empty()),
            }),
            (None, Some(MessageReference { message_id: Some(id) })) => {
                Some(ReferencedEvent { id, content: None })
            }
            _ => None,
        };

        InboundEvent {
            id: self.id,
            channel_id: self.channel_id,
            author: Author {
                display_name: self.author.global_name.unwrap_or(self.author.username),
                id: self.author.id,
            },
            content: self.content,
            attachments: self
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    id: a.id,
                    filename: a.filename,
                    content_type: a.content_type,
                    url: a.url,
                    bytes: None,
                })
                .collect(),
            referenced_event,
            timestamp: self.timestamp,
        }
    }
}
