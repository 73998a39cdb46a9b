//! Context builder: what a participant has not seen yet

use tracing::trace;

use consilium_core::{JournalEntry, ParticipantId};

use crate::journal::Journal;

/// Selects the unseen, visible entries for one participant
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBuilder {
    /// Keep only the newest N entries (cursor still advances past all)
    max_entries: Option<usize>,
}

impl ContextBuilder {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self { max_entries }
    }

    /// Entries after the participant's cursor, minus its own and hidden ones
    ///
    /// The cursor advances to the newest scanned id even when everything was
    /// filtered out. An empty result means "skip this turn".
    pub fn build(&self, journal: &mut Journal, participant: &ParticipantId) -> Vec<JournalEntry> {
        let cursor = journal.cursor(participant);
        let mut newest = cursor;
        let mut context = Vec::new();

        for entry in journal.entries().iter().filter(|e| e.id > cursor) {
            newest = newest.max(entry.id);
            if &entry.author == participant {
                continue;
            }
            if !entry.is_visible_to(participant) {
                trace!("Skipping secret entry {} (not for {})", entry.id, participant);
                continue;
            }
            context.push(entry.clone());
        }

        if newest > cursor {
            journal.advance_cursor(participant, newest);
            trace!("Cursor {} -> {}", participant, newest);
        }

        if let Some(max) = self.max_entries {
            if context.len() > max {
                context.drain(..context.len() - max);
            }
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consilium_core::{MessageMetadata, MessageStatus};

    fn secret_to(target: &str) -> MessageMetadata {
        MessageMetadata {
            status: MessageStatus::Secret,
            private_to: Some(target.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_self_delivery_and_cursor_advance() {
        let mut journal = Journal::default();
        let codex = ParticipantId::from("codex");
        journal.ensure_registered(&codex);
        journal.append(&codex, "mine", MessageMetadata::default());

        let builder = ContextBuilder::default();
        assert!(builder.build(&mut journal, &codex).is_empty());

        let user = ParticipantId::operator();
        let hello = journal.append(&user, "hello", MessageMetadata::default());
        let context = builder.build(&mut journal, &codex);
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].id, hello.id);
        assert_eq!(journal.cursor(&codex), hello.id);

        assert!(builder.build(&mut journal, &codex).is_empty());
    }

    #[test]
    fn test_secret_containment() {
        let mut journal = Journal::default();
        let user = ParticipantId::operator();
        let codex = ParticipantId::from("codex");
        let claude = ParticipantId::from("claude");
        for p in [&codex, &claude] {
            journal.ensure_registered(p);
        }

        let secret = journal.append(&user, "@@codex task", secret_to("codex"));
        let builder = ContextBuilder::default();

        assert!(builder.build(&mut journal, &claude).is_empty());
        assert_eq!(journal.cursor(&claude), secret.id);

        let context = builder.build(&mut journal, &codex);
        assert_eq!(context.len(), 1);

        let reply = journal.append(&codex, "done", secret_to("user"));
        assert!(builder.build(&mut journal, &claude).is_empty());

        let operator_view = builder.build(&mut journal, &ParticipantId::operator());
        assert_eq!(operator_view.len(), 1);
        assert_eq!(operator_view[0].id, reply.id);
    }

    #[test]
    fn test_max_entries_keeps_newest() {
        let mut journal = Journal::default();
        let user = ParticipantId::operator();
        let gemini = ParticipantId::from("gemini");
        for i in 0..5 {
            journal.append(&user, &format!("m{}", i), MessageMetadata::default());
        }

        let context = ContextBuilder::new(Some(2)).build(&mut journal, &gemini);
        let texts: Vec<&str> = context.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);
        assert_eq!(journal.cursor(&gemini), 5);
    }
}
