//! Reply header extraction
//!
//! Agents answer in two blocks: a JSON header (`{"replyto": 12, "to": [...]}`,
//! optionally inside a json code fence) followed by the message body. The
//! header is optional; anything that does not parse as a JSON object leaves
//! the whole text as the body.

use serde_json::{Map, Value};
use tracing::debug;

use consilium_core::ReplyRef;

const FENCE: &str = "```";
const FENCE_TAGS: [&str; 4] = ["", "json", "application/json", "json5"];

/// A decoded reply header and the body that followed it
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyHeader {
    pub raw: Map<String, Value>,
    pub reply_to: Option<ReplyRef>,
    pub targets: Vec<String>,
}

impl ReplyHeader {
    fn from_object(raw: Map<String, Value>) -> Self {
        let reply_to = raw.get("replyto").and_then(coerce_reply_to);
        let targets = raw.get("to").map(coerce_targets).unwrap_or_default();
        Self {
            raw,
            reply_to,
            targets,
        }
    }
}

/// Split an agent reply into its header (if any) and body
pub fn extract_header(text: &str) -> (Option<ReplyHeader>, String) {
    if text.is_empty() {
        return (None, String::new());
    }

    let mut idx = skip_whitespace(text, 0);
    let prefix = &text[..idx];
    let mut fence_close: Option<usize> = None;

    if text[idx..].starts_with(FENCE) {
        let Some(line_end) = text[idx..].find('\n').map(|i| idx + i) else {
            return (None, text.to_string());
        };
        let tag = text[idx + FENCE.len()..line_end].trim().to_lowercase();
        if !FENCE_TAGS.contains(&tag.as_str()) {
            return (None, text.to_string());
        }
        idx = line_end + 1;
        match text[idx..].find(FENCE) {
            Some(close) => fence_close = Some(idx + close),
            None => return (None, text.to_string()),
        }
    }

    idx = skip_whitespace(text, idx);
    if !text[idx..].starts_with('{') {
        return (None, text.to_string());
    }

    let Some(close) = find_matching_brace(&text[idx..]).map(|i| idx + i) else {
        debug!("Failed to locate JSON header terminator in response");
        return (None, text.to_string());
    };
    let raw = &text[idx..=close];

    let mut body_start = close + 1;
    if let Some(fence_close) = fence_close {
        if body_start <= fence_close {
            body_start = fence_close + FENCE.len();
        }
    }
    let body = text[body_start..].trim_start_matches(['\r', '\n']);

    match parse_object(raw) {
        Some(object) => (Some(ReplyHeader::from_object(object)), format!("{}{}", prefix, body)),
        None => {
            debug!("Invalid JSON header in agent response: {}", raw);
            (None, text.to_string())
        }
    }
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map_or(text.len(), |(i, _)| from + i)
}

/// Byte offset of the `}` closing the object that opens `chunk`
///
/// Braces inside string literals (with escapes) do not count.
fn find_matching_brace(chunk: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (index, byte) in chunk.bytes().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(&strip_trailing_commas(raw)) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Drop commas that directly precede `}` or `]` outside string literals
fn strip_trailing_commas(payload: &str) -> String {
    let mut result = String::with_capacity(payload.len());
    let mut in_string = false;
    let mut escape = false;

    for c in payload.chars() {
        if in_string {
            result.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '}' || c == ']' {
            let kept = result.trim_end().len();
            if result[..kept].ends_with(',') {
                result.remove(kept - 1);
            }
        } else if c == '"' {
            in_string = true;
        }
        result.push(c);
    }
    result
}

/// `replyto` as a journal id or a free-form label
pub fn coerce_reply_to(value: &Value) -> Option<ReplyRef> {
    match value {
        Value::Number(n) => n.as_u64().map(ReplyRef::Id),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(id) = trimmed.parse() {
                    return Some(ReplyRef::Id(id));
                }
            }
            Some(ReplyRef::Label(trimmed.to_string()))
        }
        _ => None,
    }
}

/// `to` as a list of non-empty names (a single string is accepted)
pub fn coerce_targets(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
