//! Operator `@name` / `@@name` mention parsing

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

use consilium_core::ParticipantId;

fn private_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@@(\w+(?:\.\w+)*)").expect("valid private mention regex"))
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@(\w+(?:\.\w+)*)").expect("valid mention regex"))
}

/// Routing extracted from one operator message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    /// `@@name`: deliver privately to this agent only
    pub private_to: Option<ParticipantId>,
    /// `@name`: agents to move to the front of the queue, in mention order
    pub prioritized: Vec<ParticipantId>,
}

/// Case-insensitive lookup of agents by id and display name
#[derive(Debug, Clone, Default)]
pub struct MentionDirectory {
    names: HashMap<String, ParticipantId>,
}

impl MentionDirectory {
    pub fn new<'a>(agents: impl IntoIterator<Item = (&'a ParticipantId, &'a str)>) -> Self {
        let mut names = HashMap::new();
        for (agent_id, display_name) in agents {
            names.insert(display_name.to_lowercase(), agent_id.clone());
            names.insert(agent_id.as_str().to_lowercase(), agent_id.clone());
        }
        Self { names }
    }

    pub fn resolve(&self, name: &str) -> Option<&ParticipantId> {
        self.names.get(&name.to_lowercase())
    }

    /// A resolved `@@name` wins; otherwise collect `@name` mentions
    pub fn parse(&self, text: &str) -> Mentions {
        if let Some(target) = self.parse_private(text) {
            debug!("Operator sent private message to: {}", target);
            return Mentions {
                private_to: Some(target),
                prioritized: Vec::new(),
            };
        }
        let prioritized = self.parse_mentions(text);
        if !prioritized.is_empty() {
            debug!("Operator mentioned: {:?}", prioritized);
        }
        Mentions {
            private_to: None,
            prioritized,
        }
    }

    /// First `@@name` only
    pub fn parse_private(&self, text: &str) -> Option<ParticipantId> {
        let found: Vec<&str> = private_pattern()
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        let first = found.first()?;
        if found.len() > 1 {
            warn!("Multiple @@mentions found ({}), using first one only", found.len());
        }
        self.resolve(first).cloned()
    }

    /// Resolved `@name` mentions, deduplicated, in order of appearance
    pub fn parse_mentions(&self, text: &str) -> Vec<ParticipantId> {
        let mut resolved: Vec<ParticipantId> = Vec::new();
        for capture in mention_pattern().captures_iter(text) {
            let Some(name) = capture.get(1) else { continue };
            if let Some(agent) = self.resolve(name.as_str()) {
                if !resolved.contains(agent) {
                    resolved.push(agent.clone());
                }
            }
        }
        resolved
    }
}
