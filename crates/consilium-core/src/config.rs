//! Configuration management for Consilium
//!
//! Workspace-level settings: prompt texts and cadence, subprocess timeouts,
//! stream limits and the initial step-mode state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::prompts::{DEFAULT_INIT_PROMPT, DEFAULT_SYSTEM_PROMPT};
use crate::{ConsiliumError, Result};

/// Workspace-level Consilium configuration
///
/// Loaded from `.consilium/config.toml` in the workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsiliumConfig {
    /// Prompt texts and system-prompt cadence
    #[serde(default)]
    pub prompts: PromptConfig,

    /// Subprocess and scheduling limits
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Start with step mode enabled
    #[serde(default)]
    pub step_mode: bool,

    /// Display name of the human operator
    #[serde(default = "default_operator_name")]
    pub operator_name: String,
}

/// Prompt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Include the system prompt every Nth message (0 = init only, 1 = always)
    #[serde(default = "default_system_prompt_period")]
    pub system_prompt_period: u32,

    /// Text appended to the role prompt on the introduction turn
    #[serde(default = "default_init_prompt")]
    pub init_prompt: String,

    /// Group-chat rules sent on periodic non-init turns
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

/// Runtime limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum wall time for one CLI invocation
    #[serde(default = "default_cli_timeout_secs")]
    pub cli_timeout_secs: u64,

    /// How long to wait for a process to exit after its stream closes
    #[serde(default = "default_exit_timeout_secs")]
    pub exit_timeout_secs: u64,

    /// Grace period between asking a process to stop and killing it
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Grace period for background tasks on shutdown or interrupt
    #[serde(default = "default_background_grace_ms")]
    pub background_grace_ms: u64,

    /// Longest single stdout line accepted from an agent CLI
    #[serde(default = "default_stream_line_limit_bytes")]
    pub stream_line_limit_bytes: usize,

    /// Number of history lines loaded on startup
    #[serde(default = "default_history_tail_lines")]
    pub history_tail_lines: usize,

    /// Cap on entries handed to a backend per turn (newest kept)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_entries: Option<usize>,
}

// Default value providers
fn default_operator_name() -> String {
    "User".to_string()
}

fn default_system_prompt_period() -> u32 {
    13
}

fn default_init_prompt() -> String {
    DEFAULT_INIT_PROMPT.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_cli_timeout_secs() -> u64 {
    1800
}

fn default_exit_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    100
}

fn default_background_grace_ms() -> u64 {
    1500
}

fn default_stream_line_limit_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_history_tail_lines() -> usize {
    2000
}

impl ConsiliumConfig {
    /// Path of the configuration file inside a workspace
    pub fn path_for(workspace: &Path) -> PathBuf {
        workspace.join(".consilium").join("config.toml")
    }

    /// Load configuration from `.consilium/config.toml` or use defaults
    pub fn load_or_default(workspace: &Path) -> Result<Self> {
        let config_path = Self::path_for(workspace);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| ConsiliumError::Config(format!("Failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.consilium/config.toml`
    pub fn write_default(workspace: &Path) -> Result<()> {
        let config_path = Self::path_for(workspace);
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ConsiliumError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl RuntimeConfig {
    pub fn cli_timeout(&self) -> Duration {
        Duration::from_secs(self.cli_timeout_secs)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }
}

impl Default for ConsiliumConfig {
    fn default() -> Self {
        Self {
            prompts: PromptConfig::default(),
            runtime: RuntimeConfig::default(),
            step_mode: false,
            operator_name: default_operator_name(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt_period: default_system_prompt_period(),
            init_prompt: default_init_prompt(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cli_timeout_secs: default_cli_timeout_secs(),
            exit_timeout_secs: default_exit_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            background_grace_ms: default_background_grace_ms(),
            stream_line_limit_bytes: default_stream_line_limit_bytes(),
            history_tail_lines: default_history_tail_lines(),
            max_context_entries: None,
        }
    }
}
