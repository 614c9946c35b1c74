use chrono::{DateTime, Utc};
use twinchat_core::{ChatSummary, Message};

/// Ordered chat list for the sidebar: most recently active first.
///
/// Every reconciled message event touches its chat's summary and moves that
/// chat to the front.
#[derive(Debug, Default)]
pub struct ChatDirectory {
    chats: Vec<ChatSummary>,
}

impl ChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_summaries(chats: Vec<ChatSummary>) -> Self {
        Self { chats }
    }

    pub fn chats(&self) -> &[ChatSummary] {
        &self.chats
    }

    pub fn get(&self, chat_id: &str) -> Option<&ChatSummary> {
        self.chats.iter().find(|c| c.id == chat_id)
    }

    /// Fold a reconciled message into the summary for its chat. Inbound
    /// messages on an inactive chat bump the unread counter.
    pub fn touch(&mut self, message: &Message, chat_is_active: bool) {
        let pos = self.chats.iter().position(|c| c.id == message.chat_id);
        let mut summary = match pos {
            Some(pos) => self.chats.remove(pos),
            None => ChatSummary {
                id: message.chat_id.clone(),
                last_message: None,
                last_active_at: message.created_at,
                unread_count: 0,
                archived: false,
            },
        };

        summary.last_message = Some(message.text_content.clone());
        summary.last_active_at = latest(summary.last_active_at, message.created_at);
        if !message.is_from_user && !chat_is_active {
            summary.unread_count += 1;
        }
        self.chats.insert(0, summary);
    }

    /// Reset the unread counter, typically when the chat is opened.
    pub fn mark_read(&mut self, chat_id: &str) {
        if let Some(chat) = self.chats.iter_mut().find(|c| c.id == chat_id) {
            chat.unread_count = 0;
        }
    }

    pub fn set_archived(&mut self, chat_id: &str, archived: bool) {
        if let Some(chat) = self.chats.iter_mut().find(|c| c.id == chat_id) {
            chat.archived = archived;
        }
    }
}

fn latest(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    if b > a {
        b
    } else {
        a
    }
}
