//! Prompt fragments sent to agent CLIs

/// Introduction instructions appended to the role prompt on the first turn
pub const DEFAULT_INIT_PROMPT: &str = "\n\nFIRST INTRODUCTION:
1. Introduce yourself: your name, role and skills.
2. WAIT for a task from the participants before acting.
3. DO NOT start working on your own.
4. DO NOT suggest starting anything until someone asks.
5. DO NOT demand work from teammates unless someone proposes it.";

/// Group-chat rules included on periodic non-init turns
pub const DEFAULT_SYSTEM_PROMPT: &str = "
You are in a workspace chat with teammates.
IMPORTANT: you share a workspace in the current directory.

RULES:
1. ACTIVELY discuss technical topics, build on teammates' ideas and offer solutions.
2. Stay engaged and critical: answer questions, contribute ideas, review solutions.
3. Evaluate every answer objectively.
4. DO NOT repeat what a teammate already said. Add your own perspective.
5. If the user asks you to stay silent, do so immediately without explanation.
6. Avoid looping conversations. If you have nothing to add, stay silent.
7. To stay silent, respond with an empty message or exactly five dots: .....

";

/// Two-block reply protocol agents are asked to follow
pub const REPLY_PROTOCOL_PROMPT: &str = r##"Reply in two blocks.

Block 1 is a JSON header with metadata:
{
  "replyto": <msg_id or null>,
  "to": ["nickname1", "nickname2", ...]
}

<Your message here, outside of any JSON>

- `replyto` is the id of the message you are replying to (take it from headers like `HEADER:{"#msg_id#": 12,}`; use `null` to start a new thread)
- `to` is the list of recipients. Use their nicknames (e.g. "John", "Ellis.Smith"). To address everyone, return ["all"]

Block 2 comes after a single blank line: your actual message in Markdown. Do not wrap the message in JSON or add extra keys.
"##;

/// Prompt used to ask a resumed session to compact its context
pub const COMPACT_PROMPT: &str = "/compact";

/// "Your name is X."
pub fn identity_line(display_name: &str) -> String {
    format!("Your name is {}.", display_name)
}

/// "You are in a group chat with A, B, C."
pub fn participants_line(participants: &[String]) -> String {
    format!("You are in a group chat with {}.", participants.join(", "))
}

/// Header line prefixed to every entry delivered to an agent
pub fn chat_header(msg_id: u64) -> String {
    format!("HEADER:{{\"#msg_id#\": {},}}", msg_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_participants() {
        assert_eq!(identity_line("Codex"), "Your name is Codex.");
        let names = vec!["User".to_string(), "Claude".to_string()];
        assert_eq!(participants_line(&names), "You are in a group chat with User, Claude.");
    }

    #[test]
    fn test_chat_header() {
        assert_eq!(chat_header(7), r##"HEADER:{"#msg_id#": 7,}"##);
    }
}
