//! Text classification: silence, context overflow, failure hints

/// Phrases agents and CLIs use when the context window is exhausted
const OVERFLOW_KEYWORDS: &[&str] = &[
    "token limit",
    "context limit",
    "context window",
    "maximum context length",
    "context length exceeded",
    "limit exceeded",
    "too many tokens",
    "prompt too long",
    "prompt is too long",
    "message is too long",
];

/// Phrases that turn buffered non-JSON output into a reported error
const FAILURE_KEYWORDS: &[&str] = &[
    "error ",
    "error:",
    "failed",
    "exception",
    "resource exhausted",
    "non utf-8",
    "json decode",
    "error code",
    "status code",
];

/// Characters an agent may emit, alone, to stay silent
const SILENCE_CHARS: &[char] = &[
    '.', '\u{2024}', '\u{2025}', '\u{2026}', '\u{2027}', '\u{22ef}', '\u{205d}',
];

/// Whether a reply means "the agent chose not to speak"
///
/// Empty, whitespace-only, or made solely of dot/ellipsis characters.
pub fn is_silent_response(text: &str) -> bool {
    let mut visible = text.chars().filter(|c| !c.is_whitespace()).peekable();
    if visible.peek().is_none() {
        return true;
    }
    visible.all(|c| SILENCE_CHARS.contains(&c))
}

/// Whether text hints at a context-window overflow
pub fn is_overflow_text(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    OVERFLOW_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Whether non-protocol output looks like a failure worth reporting
pub fn is_failure_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    FAILURE_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Remove duplicates while keeping first-seen order
pub fn dedupe_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}
