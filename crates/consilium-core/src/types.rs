//! Core type definitions for the Consilium chat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of the human operator participant
pub const OPERATOR_ID: &str = "user";

/// Stable participant identifier
///
/// Agents are keyed by their registry agent id, never by display name, so a
/// rename does not orphan cursors, sessions or queue slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The distinguished operator participant
    pub fn operator() -> Self {
        Self(OPERATOR_ID.to_string())
    }

    pub fn is_operator(&self) -> bool {
        self.0 == OPERATOR_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Delivery status of a journal entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    None,
    /// Visible only to the author, the private target and the operator
    Secret,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Secret => write!(f, "secret"),
        }
    }
}

/// Reference to an earlier message, as written by an agent in its reply header
///
/// Agents usually echo the numeric id from the context header, but free-form
/// labels are preserved rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyRef {
    Id(u64),
    Label(String),
}

impl ReplyRef {
    /// Numeric journal id, if this reference is one
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Label(_) => None,
        }
    }
}

impl std::fmt::Display for ReplyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Label(label) => write!(f, "{}", label),
        }
    }
}

/// Metadata attached to a journal entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub is_init: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub status: MessageStatus,
    /// Private delivery target (`@@name` or secret reply to the operator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_to: Option<ParticipantId>,
    /// Recipients named in the reply header (`to`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    /// Agents mentioned with `@name` by the operator, in mention order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    /// Raw decoded reply header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<serde_json::Value>,
}

impl MessageMetadata {
    pub fn is_secret(&self) -> bool {
        self.status == MessageStatus::Secret
    }
}

/// One immutable entry of the conversation journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: u64,
    pub author: ParticipantId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: MessageMetadata,
}

impl JournalEntry {
    pub fn is_secret(&self) -> bool {
        self.metadata.is_secret()
    }

    pub fn is_init(&self) -> bool {
        self.metadata.is_init
    }

    /// Whether `participant` may see this entry
    ///
    /// Secret entries are visible to their author, their private target and
    /// the operator only.
    pub fn is_visible_to(&self, participant: &ParticipantId) -> bool {
        if !self.is_secret() || participant.is_operator() || &self.author == participant {
            return true;
        }
        self.metadata.private_to.as_ref() == Some(participant)
    }
}

/// A message submitted to the courier, before it receives a journal id
#[derive(Debug, Clone, PartialEq)]
pub struct CourierMessage {
    pub author: ParticipantId,
    pub text: String,
    pub metadata: MessageMetadata,
}

impl CourierMessage {
    pub fn new(author: impl Into<ParticipantId>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Create the introduction message sent on a fresh workspace
    pub fn init(author: impl Into<ParticipantId>, text: impl Into<String>) -> Self {
        let mut message = Self::new(author, text);
        message.metadata.is_init = true;
        message
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.metadata.is_error = is_error;
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        let is_init = self.metadata.is_init;
        let is_error = self.metadata.is_error;
        self.metadata = metadata;
        self.metadata.is_init |= is_init;
        self.metadata.is_error |= is_error;
        self
    }

    /// Address the message privately to one participant (marks it secret)
    pub fn private_to(mut self, target: impl Into<ParticipantId>) -> Self {
        self.metadata.private_to = Some(target.into());
        self.metadata.status = MessageStatus::Secret;
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<ParticipantId>) -> Self {
        self.metadata.mentions = mentions;
        self
    }

    pub fn is_init(&self) -> bool {
        self.metadata.is_init
    }

    pub fn is_error(&self) -> bool {
        self.metadata.is_error
    }
}
