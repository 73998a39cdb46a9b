//! Append-only conversation journal and per-participant cursors

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::trace;

use consilium_core::{JournalEntry, MessageMetadata, ParticipantId};

/// Strictly ordered log of every message, plus each participant's cursor
///
/// A cursor is the highest journal id its participant has already been
/// shown. Only the context builder and operator sync move cursors.
#[derive(Debug, Clone)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    next_id: u64,
    cursors: BTreeMap<ParticipantId, u64>,
}

impl Journal {
    /// Start a journal whose first id follows `last_message_id`
    pub fn new(last_message_id: u64) -> Self {
        Self {
            entries: Vec::new(),
            next_id: last_message_id.saturating_add(1),
            cursors: BTreeMap::new(),
        }
    }

    /// Append an entry with the next id, registering the author if new
    pub fn append(&mut self, author: &ParticipantId, text: &str, metadata: MessageMetadata) -> JournalEntry {
        let entry = JournalEntry {
            id: self.next_id,
            author: author.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
            metadata,
        };
        self.next_id += 1;
        self.entries.push(entry.clone());
        self.ensure_registered(author);
        trace!("Journal append id={} author={}", entry.id, author);
        entry
    }

    /// Whether the entry with `id` is secret
    ///
    /// Linear scan; journals stay in the low thousands of entries.
    pub fn is_secret(&self, id: u64) -> bool {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .is_some_and(|entry| entry.is_secret())
    }

    pub fn get(&self, id: u64) -> Option<&JournalEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id of the newest entry (0 when empty)
    pub fn latest_id(&self) -> u64 {
        self.entries.last().map_or(0, |entry| entry.id)
    }

    /// Id the next appended entry will receive
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Ids of the newest `n` entries
    pub fn tail_ids(&self, n: usize) -> Vec<u64> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].iter().map(|entry| entry.id).collect()
    }

    pub fn cursor(&self, participant: &ParticipantId) -> u64 {
        self.cursors.get(participant).copied().unwrap_or(0)
    }

    /// Whether entries by others that `participant` may see lie past its cursor
    pub fn has_unseen(&self, participant: &ParticipantId) -> bool {
        let cursor = self.cursor(participant);
        self.entries
            .iter()
            .rev()
            .take_while(|entry| entry.id > cursor)
            .any(|entry| &entry.author != participant && entry.is_visible_to(participant))
    }

    /// Move a cursor forward; never moves it back
    pub fn advance_cursor(&mut self, participant: &ParticipantId, id: u64) {
        let cursor = self.cursors.entry(participant.clone()).or_insert(0);
        if id > *cursor {
            *cursor = id;
        }
    }

    /// Register a participant with cursor 0 if it has none
    pub fn ensure_registered(&mut self, participant: &ParticipantId) {
        self.cursors.entry(participant.clone()).or_insert(0);
    }

    pub fn cursors(&self) -> &BTreeMap<ParticipantId, u64> {
        &self.cursors
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consilium_core::MessageStatus;

    #[test]
    fn test_ids_continue_after_persisted_history() {
        let mut journal = Journal::new(41);
        let author = ParticipantId::operator();
        let first = journal.append(&author, "a", MessageMetadata::default());
        let second = journal.append(&author, "b", MessageMetadata::default());
        assert_eq!(first.id, 42);
        assert_eq!(second.id, 43);
        assert_eq!(journal.latest_id(), 43);
        assert_eq!(journal.next_id(), 44);
    }

    #[test]
    fn test_append_leaves_author_cursor() {
        let mut journal = Journal::default();
        let codex = ParticipantId::from("codex");
        let user = ParticipantId::operator();

        journal.append(&user, "hello", MessageMetadata::default());
        journal.advance_cursor(&codex, 1);
        // Posted while codex was still answering "hello"
        let follow_up = journal.append(&user, "follow-up", MessageMetadata::default());
        journal.append(&codex, "answer", MessageMetadata::default());

        assert_eq!(journal.cursor(&codex), 1);
        assert!(journal.has_unseen(&codex));
        assert_eq!(journal.cursor(&user), 0);

        journal.advance_cursor(&codex, follow_up.id);
        assert!(!journal.has_unseen(&codex));
    }

    #[test]
    fn test_append_registers_new_author() {
        let mut journal = Journal::default();
        let gemini = ParticipantId::from("gemini");
        journal.append(&gemini, "hi", MessageMetadata::default());
        assert_eq!(journal.cursors().get(&gemini), Some(&0));
    }

    #[test]
    fn test_cursor_never_moves_back() {
        let mut journal = Journal::default();
        let p = ParticipantId::from("claude");
        journal.advance_cursor(&p, 5);
        journal.advance_cursor(&p, 3);
        assert_eq!(journal.cursor(&p), 5);
    }

    #[test]
    fn test_is_secret() {
        let mut journal = Journal::default();
        let user = ParticipantId::operator();
        let open = journal.append(&user, "hello", MessageMetadata::default());
        let secret = journal.append(
            &user,
            "psst",
            MessageMetadata {
                status: MessageStatus::Secret,
                private_to: Some("codex".into()),
                ..Default::default()
            },
        );
        assert!(!journal.is_secret(open.id));
        assert!(journal.is_secret(secret.id));
        assert!(!journal.is_secret(999));
    }
}
