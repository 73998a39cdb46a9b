//! Prompt assembly and the periodic system-prompt policy

use regex::{Captures, Regex};
use std::sync::OnceLock;

use consilium_core::prompts::{identity_line, participants_line, REPLY_PROTOCOL_PROMPT};
use consilium_core::PromptConfig;

/// Decides which turns carry the full preamble
///
/// One policy object serves every backend; the per-agent counter lives in
/// the runtime table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemPromptPolicy {
    period: u32,
}

impl SystemPromptPolicy {
    /// `0` = init turns only, `1` = every turn, `N` = every Nth non-init turn
    pub fn new(period: u32) -> Self {
        Self { period }
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    /// Advance `counter` and report whether this turn includes the preamble
    pub fn should_include(&self, counter: &mut u32, is_init: bool) -> bool {
        if is_init {
            *counter = 0;
            return true;
        }
        match self.period {
            0 => false,
            1 => true,
            period => {
                *counter += 1;
                if *counter >= period {
                    *counter = 0;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Role/system text for a turn
///
/// Init turns get the role prompt followed by the introduction instructions;
/// other turns get the group-chat rules.
pub fn system_text(prompts: &PromptConfig, role_prompt: Option<&str>, is_init: bool) -> String {
    if is_init {
        [role_prompt.unwrap_or_default(), prompts.init_prompt.as_str()]
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    } else {
        prompts.system_prompt.trim().to_string()
    }
}

/// Full prompt with identity, reply protocol, participants and system text
pub fn compose_prompt(display_name: &str, participants: &[String], system: &str, message: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&identity_line(display_name));
    prompt.push('\n');
    prompt.push_str(REPLY_PROTOCOL_PROMPT);
    prompt.push('\n');
    prompt.push_str(&participants_line(participants));
    prompt.push('\n');
    if !system.is_empty() {
        prompt.push_str(system);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(message);
    prompt
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("env var pattern is a valid literal")
    })
}

/// Expand `$VAR`, `${VAR}` and a leading `~` in a command path
///
/// Unknown variables are left untouched.
pub fn expand_command_path(path: &str) -> String {
    let path = path.trim();
    let expanded = env_var_pattern().replace_all(path, |caps: &Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });

    if expanded == "~" || expanded.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), &expanded[1..]);
        }
    }
    expanded.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_zero_is_init_only() {
        let policy = SystemPromptPolicy::new(0);
        let mut counter = 0;
        assert!(policy.should_include(&mut counter, true));
        assert!((0..20).all(|_| !policy.should_include(&mut counter, false)));
    }

    #[test]
    fn test_period_one_is_always() {
        let policy = SystemPromptPolicy::new(1);
        let mut counter = 0;
        assert!((0..5).all(|_| policy.should_include(&mut counter, false)));
    }

    #[test]
    fn test_period_n_cycles() {
        let policy = SystemPromptPolicy::new(3);
        let mut counter = 0;
        let included: Vec<bool> = (0..7)
            .map(|_| policy.should_include(&mut counter, false))
            .collect();
        assert_eq!(included, vec![false, false, true, false, false, true, false]);
        assert_eq!(counter, 1);

        assert!(policy.should_include(&mut counter, true));
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_system_text() {
        let prompts = PromptConfig::default();
        let init = system_text(&prompts, Some("You are the reviewer."), true);
        assert!(init.starts_with("You are the reviewer."));
        assert!(init.contains("FIRST INTRODUCTION"));

        let regular = system_text(&prompts, Some("ignored"), false);
        assert!(regular.starts_with("You are in a workspace chat"));
    }

    #[test]
    fn test_compose_prompt_order() {
        let prompt = compose_prompt("Codex", &["User".to_string()], "RULES", "hello");
        let identity = prompt.find("Your name is Codex.").unwrap();
        let protocol = prompt.find("Reply in two blocks.").unwrap();
        let participants = prompt.find("You are in a group chat with User.").unwrap();
        let rules = prompt.find("RULES").unwrap();
        assert!(identity < protocol && protocol < participants && participants < rules);
        assert!(prompt.ends_with("\n\nhello"));
    }

    #[test]
    fn test_expand_command_path() {
        std::env::set_var("CONSILIUM_TEST_BIN_DIR", "/opt/agents");
        assert_eq!(expand_command_path("$CONSILIUM_TEST_BIN_DIR/codex"), "/opt/agents/codex");
        assert_eq!(expand_command_path("${CONSILIUM_TEST_BIN_DIR}/claude"), "/opt/agents/claude");
        assert_eq!(
            expand_command_path("$CONSILIUM_SURELY_UNSET_VAR/x"),
            "$CONSILIUM_SURELY_UNSET_VAR/x"
        );
        assert_eq!(expand_command_path("  gemini "), "gemini");

        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_command_path("~/bin/codex"),
                format!("{}/bin/codex", home.display())
            );
        }
    }
}
