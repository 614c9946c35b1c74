use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ChatError;
use crate::models::{Message, MessageStatus};

/// Frames sent from the client over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Typing {
        is_typing: bool,
    },
    ReadReceipt {
        message_ids: Vec<String>,
    },
    Heartbeat,
}

/// Decoded inbound events, after wire-shape normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Message(Message),
    Typing { is_typing: bool, user_id: Option<String> },
    ReadReceipt { message_ids: Vec<String> },
    ServerError { message: String },
    HeartbeatAck,
}

/// One outbound text payload plus the delay before it goes on the wire.
#[derive(Debug, Clone)]
pub struct TextVariant {
    pub payload: String,
    pub delay: Duration,
}

const VARIANT_TYPES: [(&str, u64); 3] = [("chat_message", 0), ("message", 500), ("text", 1000)];

/// Translates between raw socket frames and typed events.
///
/// The backend emits the same logical event under several shapes depending on
/// origin, so decode tries each known shape in a fixed order and the first
/// match wins. Outbound text is optionally duplicated under the alternate
/// `type` spellings with short delays; the reconciler dedups the echoes.
#[derive(Debug, Clone)]
pub struct ProtocolCodec {
    chat_id: String,
    local_user_id: Option<String>,
}

impl ProtocolCodec {
    pub fn new(chat_id: &str, local_user_id: Option<String>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            local_user_id,
        }
    }

    /// Decode one raw text frame. Returns `None` for anything unparseable or
    /// not addressed to us; plain control strings count as heartbeat acks.
    pub fn decode(&self, raw: &str) -> Option<ServerEvent> {
        match self.try_decode(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("Ignoring undecodable frame: {}", e);
                None
            }
        }
    }

    /// Strict decode. `Ok(None)` means the frame is well formed but not
    /// addressed to us, such as an echo of the local user's own typing
    /// indicator.
    pub fn try_decode(&self, raw: &str) -> Result<Option<ServerEvent>, ChatError> {
        match raw.trim() {
            "ping" | "pong" | "heartbeat_ack" => return Ok(Some(ServerEvent::HeartbeatAck)),
            _ => {}
        }

        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ChatError::MalformedFrame(e.to_string()))?;

        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ChatError::MissingField("type"))?;
        match frame_type {
            "message" | "chat_message" | "text" => Ok(Some(ServerEvent::Message(
                self.extract_message(&value)?,
            ))),
            "typing" | "typing_indicator" => {
                let is_typing = value
                    .get("is_typing")
                    .and_then(Value::as_bool)
                    .ok_or(ChatError::MissingField("is_typing"))?;
                let user_id = value
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                // Our own indicator comes back to us on some backends; only
                // admit indicators not attributable to the local actor.
                if user_id.is_some() && user_id == self.local_user_id {
                    return Ok(None);
                }
                Ok(Some(ServerEvent::Typing { is_typing, user_id }))
            }
            "read_receipt" => {
                let message_ids = value
                    .get("message_ids")
                    .and_then(Value::as_array)
                    .ok_or(ChatError::MissingField("message_ids"))?
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                Ok(Some(ServerEvent::ReadReceipt { message_ids }))
            }
            "error" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_string();
                Ok(Some(ServerEvent::ServerError { message }))
            }
            "heartbeat" | "heartbeat_ack" | "pong" => Ok(Some(ServerEvent::HeartbeatAck)),
            other => Err(ChatError::UnsupportedFrame(other.to_string())),
        }
    }

    /// Resolve the message payload, trying each known shape in order:
    /// a nested `message` object, a nested `data.message` object, then a
    /// shape synthesized from a top-level `content` field (self echoes).
    fn extract_message(&self, value: &Value) -> Result<Message, ChatError> {
        if let Some(obj) = value.get("message").filter(|v| v.is_object()) {
            return self.parse_message_object(obj);
        }
        if let Some(obj) = value
            .get("data")
            .and_then(|d| d.get("message"))
            .filter(|v| v.is_object())
        {
            return self.parse_message_object(obj);
        }
        if let Some(content) = value.get("content").and_then(Value::as_str) {
            return Ok(self.synthesize_echo(value, content));
        }
        Err(ChatError::MalformedFrame(
            "message frame without a recognizable payload shape".to_string(),
        ))
    }

    fn parse_message_object(&self, obj: &Value) -> Result<Message, ChatError> {
        let id = string_field(obj, &["id", "message_id"]).ok_or(ChatError::MissingField("id"))?;
        let text_content = string_field(obj, &["content", "text", "text_content"])
            .ok_or(ChatError::MissingField("content"))?;

        let chat_id = string_field(obj, &["chat_id", "conversation_id"])
            .unwrap_or_else(|| self.chat_id.clone());
        let is_from_user = obj
            .get("is_from_user")
            .and_then(Value::as_bool)
            .or_else(|| obj.get("sender").and_then(Value::as_str).map(|s| s == "user"))
            .unwrap_or(false);
        let created_at = timestamp_field(obj, &["created_at", "timestamp"]);
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<MessageStatus>().ok())
            .unwrap_or_default();
        let reply_to_id = string_field(obj, &["reply_to", "reply_to_id"]);

        Ok(Message {
            id,
            chat_id,
            text_content,
            is_from_user,
            created_at,
            status,
            reply_to_id,
        })
    }

    /// Self-authored echoes arrive as a bare top-level `content` without a
    /// message object. The synthesized id is derived from the content so the
    /// duplicate format-variant echoes of one send all map to the same id.
    fn synthesize_echo(&self, value: &Value, content: &str) -> Message {
        let id = string_field(value, &["id", "message_id"])
            .unwrap_or_else(|| echo_id(&self.chat_id, content));
        Message {
            id,
            chat_id: self.chat_id.clone(),
            text_content: content.to_string(),
            is_from_user: true,
            created_at: timestamp_field(value, &["created_at", "timestamp"]),
            status: MessageStatus::Sent,
            reply_to_id: string_field(value, &["reply_to", "reply_to_id"]),
        }
    }

    /// Serialize a single frame to its canonical wire form.
    pub fn encode(&self, frame: &ClientFrame) -> Result<String, ChatError> {
        match frame {
            // Some backends only understand the bare control string.
            ClientFrame::Heartbeat => Ok("ping".to_string()),
            other => Ok(serde_json::to_string(other)?),
        }
    }

    /// Build the wire payloads for one outbound text message: the canonical
    /// frame first, followed by format-variant duplicates under the alternate
    /// `type` spellings, each with its send delay. Callers that have confirmed
    /// the backend's real format pass `compat_variants = false` and get the
    /// canonical frame alone.
    pub fn encode_text_variants(
        &self,
        content: &str,
        reply_to: Option<&str>,
        compat_variants: bool,
    ) -> Vec<TextVariant> {
        let count = if compat_variants { VARIANT_TYPES.len() } else { 1 };
        VARIANT_TYPES[..count]
            .iter()
            .map(|(type_name, delay_ms)| {
                let mut payload = serde_json::json!({
                    "type": type_name,
                    "content": content,
                });
                if let Some(reply) = reply_to {
                    payload["reply_to"] = Value::String(reply.to_string());
                }
                TextVariant {
                    payload: payload.to_string(),
                    delay: Duration::from_millis(*delay_ms),
                }
            })
            .collect()
    }
}

fn string_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let v = obj.get(key)?;
        if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else {
            v.as_i64().map(|n| n.to_string())
        }
    })
}

fn timestamp_field(obj: &Value, keys: &[&str]) -> DateTime<Utc> {
    keys.iter()
        .find_map(|key| obj.get(key).and_then(Value::as_str))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Id for an echo that arrived without one, derived from chat and content so
/// the format-variant echoes of one send all share it. Two distinct sends of
/// identical text also collapse to the same id; the reconciler compensates by
/// letting a repeated id resolve the next outstanding placeholder with that
/// text.
fn echo_id(chat_id: &str, content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    chat_id.hash(&mut hasher);
    content.hash(&mut hasher);
    format!("echo-{:016x}", hasher.finish())
}
