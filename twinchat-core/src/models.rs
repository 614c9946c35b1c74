use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Prefix marking a locally generated placeholder id. Server-issued ids are
/// opaque and never placeholder-shaped, so the prefix alone is enough to tell
/// the two apart.
pub const OPTIMISTIC_ID_PREFIX: &str = "temp-";

/// Build a placeholder id for an optimistic message. The insertion sequence
/// number keeps two placeholders distinct even when created in the same
/// millisecond.
pub fn optimistic_id(seq: u64) -> String {
    format!("{}{}-{}", OPTIMISTIC_ID_PREFIX, Utc::now().timestamp_millis(), seq)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Error,
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Sent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub text_content: String,
    pub is_from_user: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl Message {
    /// Whether this message still carries a locally generated placeholder id.
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(OPTIMISTIC_ID_PREFIX)
    }

    /// Build an optimistic message for locally authored text. Status starts
    /// at `Sending` and flips once the server echo is reconciled.
    pub fn optimistic(chat_id: &str, text: &str, reply_to_id: Option<String>, seq: u64) -> Self {
        Message {
            id: optimistic_id(seq),
            chat_id: chat_id.to_string(),
            text_content: text.to_string(),
            is_from_user: true,
            created_at: Utc::now(),
            status: MessageStatus::Sending,
            reply_to_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSummary {
    pub id: String,
    pub last_message: Option<String>,
    pub last_active_at: DateTime<Utc>,
    pub unread_count: u32,
    pub archived: bool,
}
