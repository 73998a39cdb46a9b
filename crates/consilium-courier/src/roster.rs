//! Participant roster and context formatting
//!
//! A roster is a point-in-time view of who is in the chat: the operator
//! first, then every agent in registration order. It resolves display names,
//! renders journal entries for delivery, and maps `@alias` tokens to
//! participants.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use consilium_core::prompts::chat_header;
use consilium_core::{JournalEntry, ParticipantId};

use crate::mentions::MentionDirectory;

fn alias_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([^\s@]+)").expect("valid alias regex"))
}

const BROADCAST_ALIASES: [&str; 2] = ["all", "everyone"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterMember {
    pub id: ParticipantId,
    pub display_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Roster {
    members: Vec<RosterMember>,
}

enum Alias {
    Everyone,
    Participant(ParticipantId),
}

impl Roster {
    /// Roster holding only the operator
    pub fn new(operator_name: &str) -> Self {
        Self {
            members: vec![RosterMember {
                id: ParticipantId::operator(),
                display_name: operator_name.to_string(),
                enabled: true,
            }],
        }
    }

    pub fn with_agent(mut self, id: ParticipantId, display_name: &str, enabled: bool) -> Self {
        self.push_agent(id, display_name, enabled);
        self
    }

    pub fn push_agent(&mut self, id: ParticipantId, display_name: &str, enabled: bool) {
        self.members.push(RosterMember {
            id,
            display_name: display_name.to_string(),
            enabled,
        });
    }

    pub fn members(&self) -> &[RosterMember] {
        &self.members
    }

    /// Operator plus enabled agents, in roster order
    pub fn active(&self) -> impl Iterator<Item = &RosterMember> {
        self.members.iter().filter(|m| m.enabled)
    }

    pub fn display_name(&self, id: &ParticipantId) -> String {
        self.members
            .iter()
            .find(|m| &m.id == id)
            .map_or_else(|| id.to_string(), |m| m.display_name.clone())
    }

    /// Display names of active participants other than `exclude`
    pub fn participant_names(&self, exclude: &ParticipantId) -> Vec<String> {
        self.active()
            .filter(|m| &m.id != exclude)
            .map(|m| m.display_name.clone())
            .collect()
    }

    /// Lookup for operator mentions (every agent, enabled or not)
    pub fn mention_directory(&self) -> MentionDirectory {
        MentionDirectory::new(
            self.members
                .iter()
                .filter(|m| !m.id.is_operator())
                .map(|m| (&m.id, m.display_name.as_str())),
        )
    }

    /// Render entries for delivery, separated by blank lines
    pub fn format_context(&self, entries: &[JournalEntry]) -> String {
        entries
            .iter()
            .map(|entry| self.format_entry(entry))
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim_end()
            .to_string()
    }

    pub fn format_entry(&self, entry: &JournalEntry) -> String {
        let targets = self.resolve_targets(entry);
        let to_line = if targets.is_empty() {
            "all".to_string()
        } else {
            targets.join(", ")
        };
        format!(
            "{}\nfrom: {}\nto: {}\n\n{}",
            chat_header(entry.id),
            self.display_name(&entry.author),
            to_line,
            entry.text
        )
    }

    /// Who an entry is addressed to; empty means everyone
    ///
    /// Header targets win. Otherwise `@alias` tokens in the text are matched
    /// against active participants; `@all`/`@everyone` means everyone.
    pub fn resolve_targets(&self, entry: &JournalEntry) -> Vec<String> {
        let declared: Vec<String> = entry
            .metadata
            .targets
            .iter()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect();
        if !declared.is_empty() {
            return declared;
        }

        let aliases = self.alias_map();
        let mut mentioned: HashSet<&ParticipantId> = HashSet::new();
        for capture in alias_token_pattern().captures_iter(&entry.text) {
            let Some(token) = capture.get(1) else { continue };
            let normalized = normalize_alias(token.as_str());
            if normalized.is_empty() {
                continue;
            }
            match aliases.get(&normalized) {
                Some(Alias::Everyone) => return Vec::new(),
                Some(Alias::Participant(id)) => {
                    mentioned.insert(id);
                }
                None => {}
            }
        }

        self.active()
            .filter(|m| mentioned.contains(&m.id))
            .map(|m| m.display_name.clone())
            .collect()
    }

    fn alias_map(&self) -> HashMap<String, Alias> {
        let mut aliases: HashMap<String, Alias> = BROADCAST_ALIASES
            .iter()
            .map(|a| (a.to_string(), Alias::Everyone))
            .collect();
        for member in self.active() {
            let compact = member.display_name.replace(' ', "");
            for alias in [member.id.as_str(), member.display_name.as_str(), compact.as_str()] {
                let normalized = normalize_alias(alias);
                if !normalized.is_empty() {
                    aliases.insert(normalized, Alias::Participant(member.id.clone()));
                }
            }
        }
        aliases
    }
}

/// Lowercase and keep only `[0-9a-z]`
fn normalize_alias(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        .collect()
}
