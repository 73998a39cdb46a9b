//! Backend kinds and their wire protocols
//!
//! Each agent CLI has its own flags and JSON event vocabulary. The closed
//! [`BackendKind`] enum maps a stable backend id to command construction,
//! event parsing and compaction support.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::classify::is_overflow_text;
use crate::event::StreamEvent;
use consilium_core::ConsiliumError;

/// Longest tool-call detail surfaced to the operator
const TOOL_DETAIL_CHARS: usize = 50;

/// Supported agent CLIs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Codex,
    Claude,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Codex, Self::Claude, Self::Gemini];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    /// Human-readable backend name
    pub fn label(&self) -> &'static str {
        match self {
            Self::Codex => "OpenAI Codex CLI",
            Self::Claude => "Claude Code CLI",
            Self::Gemini => "Gemini CLI",
        }
    }

    /// Executable used when no command path is configured
    pub fn default_executable(&self) -> &'static str {
        self.id()
    }

    /// Resolve a backend id, falling back to the default backend
    pub fn resolve(id: Option<&str>) -> Self {
        id.and_then(|id| id.parse().ok()).unwrap_or_default()
    }

    /// Arguments for one turn (program excluded)
    pub fn build_args(&self, prompt: &str, session_id: Option<&str>) -> Vec<String> {
        let session_id = session_id.map(str::trim).filter(|s| !s.is_empty());
        let mut args: Vec<String> = Vec::new();
        match self {
            Self::Codex => {
                args.extend(
                    [
                        "exec",
                        "--json",
                        "--dangerously-bypass-approvals-and-sandbox",
                        "--skip-git-repo-check",
                    ]
                    .map(String::from),
                );
                if let Some(id) = session_id {
                    args.push("resume".to_string());
                    args.push(id.to_string());
                }
                args.push(prompt.to_string());
            }
            Self::Claude => {
                args.extend(["-p".to_string(), prompt.to_string()]);
                args.extend(
                    ["--output-format", "stream-json", "--verbose"].map(String::from),
                );
                if let Some(id) = session_id {
                    args.push("--resume".to_string());
                    args.push(id.to_string());
                }
                args.push("--dangerously-skip-permissions".to_string());
            }
            Self::Gemini => {
                args.extend([
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format=stream-json".to_string(),
                ]);
                if let Some(id) = session_id {
                    args.push("--resume".to_string());
                    args.push(id.to_string());
                }
                args.extend(["--verbose", "--dangerously-skip-permissions"].map(String::from));
            }
        }
        args
    }

    /// Whether a live session can be compacted in place
    pub fn supports_compaction(&self) -> bool {
        matches!(self, Self::Codex | Self::Claude)
    }

    /// Interpret one decoded JSON event
    pub fn parse_event(&self, event: &Value) -> Vec<StreamEvent> {
        match self {
            Self::Codex => parse_codex(event),
            Self::Claude => parse_claude(event),
            Self::Gemini => parse_gemini(event),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for BackendKind {
    type Err = ConsiliumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "codex" => Ok(Self::Codex),
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            other => Err(ConsiliumError::UnknownBackend(other.to_string())),
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn parse_codex(event: &Value) -> Vec<StreamEvent> {
    match str_field(event, "type").unwrap_or("unknown") {
        "thread.started" => str_field(event, "thread_id")
            .filter(|id| !id.is_empty())
            .map(|id| vec![StreamEvent::Session(id.to_string())])
            .unwrap_or_default(),
        "error" | "turn.failed" => {
            let message = str_field(event, "message")
                .filter(|m| !m.is_empty())
                .or_else(|| event.get("error").and_then(|e| str_field(e, "message")))
                .unwrap_or("");
            if message.to_lowercase().contains("context window") {
                vec![StreamEvent::Overflow(message.to_string())]
            } else if message.is_empty() {
                vec![StreamEvent::Error("Unknown codex error".to_string())]
            } else {
                vec![StreamEvent::Error(message.to_string())]
            }
        }
        "item.completed" => {
            let item = event.get("item").unwrap_or(&Value::Null);
            match str_field(item, "type").unwrap_or("") {
                "command_execution" if str_field(item, "status") == Some("completed") => {
                    vec![StreamEvent::ToolCall {
                        tool: "bash".to_string(),
                        detail: truncate_chars(
                            str_field(item, "command").unwrap_or(""),
                            TOOL_DETAIL_CHARS,
                        ),
                    }]
                }
                "agent_message" | "message" => vec![StreamEvent::Final(
                    str_field(item, "text").unwrap_or("").to_string(),
                )],
                _ => Vec::new(),
            }
        }
        "message" => str_field(event, "text")
            .filter(|t| !t.is_empty())
            .map(|t| vec![StreamEvent::Final(t.to_string())])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn claude_tool_detail(input: &Value) -> String {
    let detail = ["command", "file_path", "path", "pattern", "url", "description"]
        .iter()
        .find_map(|key| str_field(input, key))
        .unwrap_or("");
    truncate_chars(detail, TOOL_DETAIL_CHARS)
}

fn parse_claude(event: &Value) -> Vec<StreamEvent> {
    match str_field(event, "type").unwrap_or("") {
        "system" => str_field(event, "session_id")
            .filter(|id| !id.is_empty())
            .map(|id| vec![StreamEvent::Session(id.to_string())])
            .unwrap_or_default(),
        "assistant" => {
            let content = event
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array);
            let Some(blocks) = content else {
                return Vec::new();
            };

            let mut events = Vec::new();
            let mut text = String::new();
            for block in blocks {
                match str_field(block, "type") {
                    Some("text") => text.push_str(str_field(block, "text").unwrap_or("")),
                    Some("tool_use") => events.push(StreamEvent::ToolCall {
                        tool: str_field(block, "name").unwrap_or("unknown").to_string(),
                        detail: claude_tool_detail(block.get("input").unwrap_or(&Value::Null)),
                    }),
                    _ => {}
                }
            }
            if !text.trim().is_empty() {
                events.push(StreamEvent::Text(text));
            }
            events
        }
        "result" => {
            let mut events = Vec::new();
            if let Some(id) = str_field(event, "session_id").filter(|id| !id.is_empty()) {
                events.push(StreamEvent::Session(id.to_string()));
            }
            let result = str_field(event, "result").unwrap_or("");
            let is_error = event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || str_field(event, "subtype").is_some_and(|s| s.starts_with("error"));

            if is_error {
                let message = if result.is_empty() {
                    str_field(event, "subtype").unwrap_or("Unknown claude error")
                } else {
                    result
                };
                if is_overflow_text(message) {
                    events.push(StreamEvent::Overflow(message.to_string()));
                } else {
                    events.push(StreamEvent::Error(message.to_string()));
                }
            } else if result.is_empty() {
                events.push(StreamEvent::Complete);
            } else {
                events.push(StreamEvent::Final(result.to_string()));
            }
            events
        }
        _ => Vec::new(),
    }
}

fn parse_gemini(event: &Value) -> Vec<StreamEvent> {
    match str_field(event, "type").unwrap_or("") {
        "system" | "init" => str_field(event, "session_id")
            .filter(|id| !id.is_empty())
            .map(|id| vec![StreamEvent::Session(id.to_string())])
            .unwrap_or_default(),
        "message" if str_field(event, "role") == Some("assistant") => {
            let content = str_field(event, "content").unwrap_or("");
            if content.is_empty() {
                Vec::new()
            } else if event.get("delta").and_then(Value::as_bool).unwrap_or(false) {
                vec![StreamEvent::Delta(content.to_string())]
            } else {
                vec![StreamEvent::Text(content.to_string())]
            }
        }
        "tool_use" => vec![StreamEvent::ToolCall {
            tool: str_field(event, "tool_name").unwrap_or("unknown").to_string(),
            detail: String::new(),
        }],
        "result" => vec![StreamEvent::Complete],
        "error" => {
            let message = event
                .get("error")
                .and_then(|e| e.as_str().or_else(|| str_field(e, "message")))
                .or_else(|| str_field(event, "message"))
                .unwrap_or("");
            if message.is_empty() {
                Vec::new()
            } else if is_overflow_text(message) {
                vec![StreamEvent::Overflow(message.to_string())]
            } else {
                vec![StreamEvent::Error(message.to_string())]
            }
        }
        _ => Vec::new(),
    }
}
