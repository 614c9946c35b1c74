use std::collections::HashSet;

use twinchat_core::{Message, MessageStatus};
use url::Url;

/// What `admit` did to the authoritative list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Already admitted under this id; nothing changed.
    Duplicate,
    /// A server-confirmed message replaced an optimistic placeholder in place.
    Replaced { index: usize, replaced_id: String },
    /// Appended as a new entry.
    Appended { index: usize },
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Insertion sequence; tie-breaks equal `created_at` values so network
    /// delivery order never leaks into the list order.
    seq: i64,
}

/// Merges optimistic, live, and paginated message sources into one ordered,
/// deduplicated list for a single chat.
///
/// Identity is the message id. Optimistic placeholders carry a prefixed,
/// locally generated id; the server echo of the same logical message replaces
/// the placeholder in place instead of appending a duplicate.
pub struct MessageReconciler {
    chat_id: String,
    entries: Vec<Entry>,
    dedup: HashSet<String>,
    next_seq: i64,
    /// Backfilled pages get decreasing sequence numbers so that within one
    /// timestamp, older pages still sort ahead of live traffic.
    prepend_seq: i64,
    cursor: Option<String>,
    has_more: bool,
}

impl MessageReconciler {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            entries: Vec::new(),
            dedup: HashSet::new(),
            next_seq: 0,
            prepend_seq: -1,
            cursor: None,
            has_more: true,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the authoritative list in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Message at a display-order index.
    pub fn message_at(&self, index: usize) -> Option<&Message> {
        self.entries.get(index).map(|e| &e.message)
    }

    /// Create, admit, and return an optimistic placeholder for locally
    /// authored text.
    pub fn create_optimistic(&mut self, text: &str, reply_to_id: Option<String>) -> Message {
        let seq = self.take_seq();
        let message = Message::optimistic(&self.chat_id, text, reply_to_id, seq as u64);
        self.dedup.insert(message.id.clone());
        self.entries.push(Entry {
            message: message.clone(),
            seq,
        });
        self.resort();
        message
    }

    /// Admit one message into the authoritative list.
    pub fn admit(&mut self, mut message: Message) -> AdmitOutcome {
        // Server-confirmed copy of something we sent optimistically: replace
        // the placeholder in place so the entry keeps its list position.
        // This runs before the dedup check because synthesized echo ids
        // collapse across sends of identical text, and a repeated id must
        // still resolve the next outstanding placeholder for that text.
        if message.is_from_user && !message.is_optimistic() {
            if let Some(pos) = self.entries.iter().position(|e| {
                e.message.is_optimistic()
                    && e.message.is_from_user
                    && e.message.text_content == message.text_content
            }) {
                let entry = &mut self.entries[pos];
                let replaced_id = entry.message.id.clone();
                self.dedup.remove(&replaced_id);
                self.dedup.insert(message.id.clone());

                // Position is anchored by the placeholder's timestamp and
                // sequence; only identity and status come from the server.
                message.created_at = entry.message.created_at;
                if message.status == MessageStatus::Sending {
                    message.status = MessageStatus::Sent;
                }
                entry.message = message;
                tracing::debug!(
                    "Replaced optimistic {} with confirmed {}",
                    replaced_id,
                    self.entries[pos].message.id
                );
                return AdmitOutcome::Replaced {
                    index: pos,
                    replaced_id,
                };
            }
        }

        if self.dedup.contains(&message.id) {
            tracing::debug!("Rejecting duplicate message {}", message.id);
            return AdmitOutcome::Duplicate;
        }

        let seq = self.take_seq();
        self.dedup.insert(message.id.clone());
        let id = message.id.clone();
        self.entries.push(Entry { message, seq });
        self.resort();
        let index = self
            .entries
            .iter()
            .position(|e| e.message.id == id)
            .expect("entry just inserted");
        AdmitOutcome::Appended { index }
    }

    /// Merge one older page from a cursor fetch. Only messages not already
    /// admitted are prepended; the cursor advances to the server-provided
    /// `next` link. Returns how many messages were added.
    pub fn merge_older(&mut self, page: Vec<Message>, next: Option<&str>) -> usize {
        let mut added = 0;
        for message in page {
            if self.dedup.contains(&message.id) {
                continue;
            }
            self.dedup.insert(message.id.clone());
            self.entries.push(Entry {
                message,
                seq: self.prepend_seq,
            });
            self.prepend_seq -= 1;
            added += 1;
        }
        self.resort();
        self.cursor = next.and_then(cursor_from_next);
        self.has_more = next.is_some();
        added
    }

    /// Flip the given messages to `read`. Returns how many changed.
    pub fn apply_read_receipt(&mut self, message_ids: &[String]) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if message_ids.contains(&entry.message.id)
                && entry.message.status != MessageStatus::Read
            {
                entry.message.status = MessageStatus::Read;
                changed += 1;
            }
        }
        changed
    }

    /// Mark one message as failed, e.g. after the send path gave up on it.
    pub fn mark_error(&mut self, message_id: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == message_id) {
            Some(entry) => {
                entry.message.status = MessageStatus::Error;
                true
            }
            None => false,
        }
    }

    /// Remove a message from the list and the dedup set. Only an explicit
    /// user delete goes through here.
    pub fn delete(&mut self, message_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.message.id != message_id);
        self.dedup.remove(message_id);
        self.entries.len() != before
    }

    /// Inbound messages the local user has not read yet; the coordinator
    /// acknowledges these after the initial load.
    pub fn unread_inbound_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.message.is_from_user && e.message.status != MessageStatus::Read)
            .map(|e| e.message.id.clone())
            .collect()
    }

    fn take_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn resort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.seq.cmp(&b.seq))
        });
    }
}

fn cursor_from_next(next: &str) -> Option<String> {
    let parsed = Url::parse(next)
        .or_else(|_| Url::parse("http://relative.invalid").expect("static url").join(next))
        .ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "cursor")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn server_msg(id: &str, text: &str, from_user: bool, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            chat_id: "c1".to_string(),
            text_content: text.to_string(),
            is_from_user: from_user,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + Duration::seconds(secs),
            status: MessageStatus::Sent,
            reply_to_id: None,
        }
    }

    #[test]
    fn test_duplicate_admission_is_idempotent() {
        let mut rec = MessageReconciler::new("c1");
        let msg = server_msg("srv-1", "hello", false, 0);

        assert!(matches!(
            rec.admit(msg.clone()),
            AdmitOutcome::Appended { .. }
        ));
        assert_eq!(rec.admit(msg), AdmitOutcome::Duplicate);
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.messages()[0].text_content, "hello");
    }

    #[test]
    fn test_optimistic_replacement_preserves_position() {
        let mut rec = MessageReconciler::new("c1");
        rec.admit(server_msg("srv-1", "earlier", false, 0));
        let placeholder = rec.create_optimistic("hi", None);
        assert!(placeholder.id.starts_with("temp-"));

        let confirmed = server_msg("srv-42", "hi", true, 5);
        let outcome = rec.admit(confirmed);

        match outcome {
            AdmitOutcome::Replaced { index, replaced_id } => {
                assert_eq!(index, 1);
                assert_eq!(replaced_id, placeholder.id);
            }
            other => panic!("expected replacement, got {:?}", other),
        }

        let messages = rec.messages();
        assert_eq!(messages.len(), 2);
        let with_text: Vec<_> = messages
            .iter()
            .filter(|m| m.text_content == "hi")
            .collect();
        assert_eq!(with_text.len(), 1);
        assert_eq!(with_text[0].id, "srv-42");
        assert_eq!(with_text[0].status, MessageStatus::Sent);
        assert_eq!(messages[1].id, "srv-42");
    }

    #[test]
    fn test_replacement_id_can_not_be_admitted_twice() {
        let mut rec = MessageReconciler::new("c1");
        rec.create_optimistic("hi", None);
        rec.admit(server_msg("srv-42", "hi", true, 0));
        // A delayed format-variant echo of the same message.
        assert_eq!(
            rec.admit(server_msg("srv-42", "hi", true, 0)),
            AdmitOutcome::Duplicate
        );
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn test_repeated_echo_id_resolves_each_outstanding_placeholder() {
        let mut rec = MessageReconciler::new("c1");
        rec.create_optimistic("hi", None);
        rec.create_optimistic("hi", None);

        // Two separate sends of identical text echo back under the same
        // synthesized id. Each echo resolves one placeholder; only then do
        // further copies count as duplicates.
        assert!(matches!(
            rec.admit(server_msg("echo-abc", "hi", true, 1)),
            AdmitOutcome::Replaced { .. }
        ));
        assert!(matches!(
            rec.admit(server_msg("echo-abc", "hi", true, 2)),
            AdmitOutcome::Replaced { .. }
        ));
        assert_eq!(
            rec.admit(server_msg("echo-abc", "hi", true, 3)),
            AdmitOutcome::Duplicate
        );

        let messages = rec.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.id == "echo-abc"));
        assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
    }

    #[test]
    fn test_two_optimistic_entries_with_same_text_replace_independently() {
        let mut rec = MessageReconciler::new("c1");
        rec.create_optimistic("hi", None);
        rec.create_optimistic("hi", None);

        rec.admit(server_msg("srv-1", "hi", true, 1));
        rec.admit(server_msg("srv-2", "hi", true, 2));

        let ids: Vec<_> = rec.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["srv-1", "srv-2"]);
    }

    #[test]
    fn test_ordering_by_created_at_regardless_of_admission_order() {
        let mut rec = MessageReconciler::new("c1");
        rec.admit(server_msg("srv-3", "third", false, 30));
        rec.admit(server_msg("srv-1", "first", false, 10));
        rec.admit(server_msg("srv-2", "second", false, 20));

        let texts: Vec<_> = rec
            .messages()
            .iter()
            .map(|m| m.text_content.clone())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_same_timestamp_tie_broken_by_insertion_sequence() {
        let mut rec = MessageReconciler::new("c1");
        rec.admit(server_msg("srv-a", "a", false, 0));
        rec.admit(server_msg("srv-b", "b", false, 0));
        rec.admit(server_msg("srv-c", "c", false, 0));

        let ids: Vec<_> = rec.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["srv-a", "srv-b", "srv-c"]);
    }

    #[test]
    fn test_backfill_prepends_only_unseen_ids() {
        let mut rec = MessageReconciler::new("c1");
        rec.admit(server_msg("srv-5", "live", false, 50));

        let page = vec![
            server_msg("srv-1", "old one", false, 10),
            server_msg("srv-5", "live", false, 50),
            server_msg("srv-2", "old two", false, 20),
        ];
        let added = rec.merge_older(page, Some("https://api.example.com/messages/?cursor=abc123"));

        assert_eq!(added, 2);
        assert_eq!(rec.len(), 3);
        assert_eq!(rec.cursor(), Some("abc123"));
        assert!(rec.has_more());

        let ids: Vec<_> = rec.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["srv-1", "srv-2", "srv-5"]);
    }

    #[test]
    fn test_exhausted_pagination_clears_cursor() {
        let mut rec = MessageReconciler::new("c1");
        rec.merge_older(vec![server_msg("srv-1", "old", false, 0)], None);
        assert!(!rec.has_more());
        assert_eq!(rec.cursor(), None);
    }

    #[test]
    fn test_backfill_with_relative_next_link() {
        let mut rec = MessageReconciler::new("c1");
        rec.merge_older(Vec::new(), Some("/api/messages/?cursor=xyz&page_size=30"));
        assert_eq!(rec.cursor(), Some("xyz"));
    }

    #[test]
    fn test_read_receipt_transitions_status() {
        let mut rec = MessageReconciler::new("c1");
        rec.create_optimistic("hi", None);
        rec.admit(server_msg("srv-42", "hi", true, 0));

        let changed = rec.apply_read_receipt(&["srv-42".to_string()]);
        assert_eq!(changed, 1);
        assert_eq!(rec.messages()[0].status, MessageStatus::Read);

        // Idempotent.
        assert_eq!(rec.apply_read_receipt(&["srv-42".to_string()]), 0);
    }

    #[test]
    fn test_delete_removes_from_list_and_dedup_set() {
        let mut rec = MessageReconciler::new("c1");
        rec.admit(server_msg("srv-1", "bye", false, 0));

        assert!(rec.delete("srv-1"));
        assert!(rec.is_empty());

        // Gone from the dedup set too, so an explicit re-admit works.
        assert!(matches!(
            rec.admit(server_msg("srv-1", "bye", false, 0)),
            AdmitOutcome::Appended { .. }
        ));
    }

    #[test]
    fn test_unread_inbound_ids_excludes_own_and_read() {
        let mut rec = MessageReconciler::new("c1");
        rec.admit(server_msg("srv-1", "from twin", false, 0));
        rec.admit(server_msg("srv-2", "from me", true, 1));
        let mut read = server_msg("srv-3", "already read", false, 2);
        read.status = MessageStatus::Read;
        rec.admit(read);

        assert_eq!(rec.unread_inbound_ids(), vec!["srv-1".to_string()]);
    }

    #[test]
    fn test_mark_error_flags_placeholder() {
        let mut rec = MessageReconciler::new("c1");
        let placeholder = rec.create_optimistic("hi", None);
        assert!(rec.mark_error(&placeholder.id));
        assert_eq!(rec.messages()[0].status, MessageStatus::Error);
    }
}
