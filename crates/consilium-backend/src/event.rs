//! Normalized events extracted from backend JSON streams

/// One normalized event from an agent CLI's JSON-lines stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Session/thread identifier to resume later
    Session(String),
    /// Tool invocation notice (not part of the reply body)
    ToolCall { tool: String, detail: String },
    /// Replace the current reply text
    Text(String),
    /// Append to the current reply text
    Delta(String),
    /// Final reply text; stops the stream read
    Final(String),
    /// Completion without new text; stops the stream read
    Complete,
    /// Context window exhausted; stops the stream read
    Overflow(String),
    /// Fatal backend error; stops the stream read
    Error(String),
}

impl StreamEvent {
    /// Whether this event ends the stream read
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Final(_) | Self::Complete | Self::Overflow(_) | Self::Error(_)
        )
    }
}
