//! Consilium CLI - a group chat between you and your coding agents
//!
//! Usage:
//!   consilium [WORKSPACE]          Chat in WORKSPACE (default: current directory)
//!   consilium --step               Start with step mode on
//!   consilium --write-config       Write a default .consilium/config.toml and exit
//!
//! At the prompt, plain text is sent to every enabled agent. `@name` moves an
//! agent to the front of the queue, `@@name` talks to one agent privately.
//!
//!   /step                Toggle step mode
//!   /next                Approve the delivery waiting in step mode
//!   /members             List members and their participation
//!   /enable <name>       Let an agent take part again
//!   /disable <name>      Stop delivering to an agent
//!   /interrupt           Stop running agents, keep the queue
//!   /quit                Leave the chat

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use consilium_backend::{AgentRuntimeTable, TokioCliRunner, TurnObserver};
use consilium_core::{ConsiliumConfig, JournalEntry, Notice, ParticipantId};
use consilium_courier::{Conversation, ConversationParts, CourierCollaborator, StepContinue};
use consilium_store::{AgentRegistry, FileSessionStore, RoleCatalog};

#[derive(Parser)]
#[command(name = "consilium")]
#[command(author, version, about = "Group chat with coding agent CLIs")]
struct Cli {
    /// Workspace the agents work in
    #[arg(default_value = ".")]
    workspace: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log to stderr instead of the session log file
    #[arg(long)]
    log_stderr: bool,

    /// Start with step mode on
    #[arg(long)]
    step: bool,

    /// Write a default config file into the workspace and exit
    #[arg(long)]
    write_config: bool,
}

/// One line typed at the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Empty,
    Message(String),
    ToggleStep,
    Next,
    Members,
    Enable(String),
    Disable(String),
    Interrupt,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name.to_lowercase().as_str(), arg) {
        ("step", _) => Input::ToggleStep,
        ("next" | "continue", _) => Input::Next,
        ("members", _) => Input::Members,
        ("enable", agent) if !agent.is_empty() => Input::Enable(agent.to_string()),
        ("disable", agent) if !agent.is_empty() => Input::Disable(agent.to_string()),
        ("interrupt" | "stop", _) => Input::Interrupt,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Prints the chat to the terminal
struct TerminalHost {
    operator_name: String,
    runtimes: OnceLock<Arc<AgentRuntimeTable>>,
}

impl TerminalHost {
    fn new(operator_name: &str) -> Self {
        Self {
            operator_name: operator_name.to_string(),
            runtimes: OnceLock::new(),
        }
    }

    fn display_name(&self, author: &ParticipantId) -> String {
        if author.is_operator() {
            return self.operator_name.clone();
        }
        self.runtimes
            .get()
            .and_then(|runtimes| runtimes.display_name(author))
            .unwrap_or_else(|| author.to_string())
    }
}

impl TurnObserver for TerminalHost {
    fn notice(&self, notice: Notice) {
        let line = format!("-- {}", notice);
        if notice.is_warning() {
            println!("{}", line.yellow());
        } else {
            println!("{}", line.dimmed());
        }
    }

    fn tool_call(&self, agent: &ParticipantId, tool: &str, detail: &str) {
        let line = format!("   {} {}: {}", self.display_name(agent), tool, detail);
        println!("{}", line.dimmed());
    }
}

#[async_trait]
impl CourierCollaborator for TerminalHost {
    async fn publish_entry(&self, entry: &JournalEntry) {
        if entry.author.is_operator() {
            return;
        }
        let name = format!("[{}] {}", entry.id, self.display_name(&entry.author));
        let name = if entry.metadata.is_error {
            name.red().bold()
        } else if entry.is_secret() {
            name.magenta().bold()
        } else {
            name.cyan().bold()
        };
        println!("{}\n{}\n", name, entry.text);
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let workspace = std::fs::canonicalize(&cli.workspace)
        .with_context(|| format!("Workspace {} does not exist", cli.workspace.display()))?;

    if cli.write_config {
        ConsiliumConfig::write_default(&workspace).context("Failed to write default config")?;
        println!("Wrote {}", ConsiliumConfig::path_for(&workspace).display());
        return Ok(());
    }

    let mut config = ConsiliumConfig::load_or_default(&workspace).context("Failed to load config")?;
    if cli.step {
        config.step_mode = true;
    }

    let store = Arc::new(
        FileSessionStore::open(&workspace, config.runtime.history_tail_lines)
            .await
            .context("Failed to open session store")?,
    );

    let log_file = if cli.log_stderr {
        None
    } else {
        let logs_dir = store.logs_dir();
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
        Some(logs_dir.join(format!("chat_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"))))
    };
    init_logging(cli.verbose, log_file.as_deref())?;
    info!("Consilium starting in {}", workspace.display());

    let roles = match RoleCatalog::default_root() {
        Ok(root) => match RoleCatalog::open(root).await {
            Ok(catalog) => Some(Arc::new(catalog)),
            Err(e) => {
                warn!("Roles unavailable: {}", e);
                None
            }
        },
        Err(e) => {
            warn!("Roles unavailable: {}", e);
            None
        }
    };

    let host = Arc::new(TerminalHost::new(&config.operator_name));
    let conversation = Conversation::start(ConversationParts {
        workspace: workspace.clone(),
        config,
        runner: Arc::new(TokioCliRunner),
        store,
        registry: Arc::new(AgentRegistry::for_workspace(&workspace)),
        roles,
        host: host.clone(),
    })
    .await
    .context("Failed to start conversation")?;
    let _ = host.runtimes.set(Arc::clone(conversation.runtimes()));

    println!("{}", format!("Consilium - {}", workspace.display()).bold());
    if let Some(path) = &log_file {
        println!("{}", format!("Log: {}", path.display()).dimmed());
    }
    print_members(&conversation);
    if conversation.gate().is_step_mode() {
        println!("{}", "Step mode is on: /next approves each delivery".dimmed());
    }
    conversation.introduce().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !handle_input(&conversation, parse_input(&line)).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    conversation.shutdown().await;
    info!("Consilium stopped");
    Ok(())
}

/// Apply one input; returns false when the operator leaves
async fn handle_input(conversation: &Arc<Conversation<TokioCliRunner>>, input: Input) -> bool {
    match input {
        Input::Empty => {}
        Input::Message(text) => {
            conversation.submit(&text).await;
        }
        Input::ToggleStep => {
            conversation.toggle_step_mode();
        }
        Input::Next => {
            if conversation.continue_step() == StepContinue::StepModeOff {
                println!("{}", "Step mode is off".dimmed());
            }
        }
        Input::Members => print_members(conversation),
        Input::Enable(name) => set_enabled(conversation, &name, true).await,
        Input::Disable(name) => set_enabled(conversation, &name, false).await,
        Input::Interrupt => conversation.interrupt().await,
        Input::Quit => return false,
        Input::Unknown(line) => println!("{}", format!("Unknown command: {}", line).yellow()),
    }
    true
}

async fn set_enabled(conversation: &Arc<Conversation<TokioCliRunner>>, name: &str, enabled: bool) {
    let agent_id = conversation
        .courier()
        .roster()
        .mention_directory()
        .resolve(name)
        .cloned()
        .unwrap_or_else(|| ParticipantId::from(name));
    if let Err(e) = conversation.set_agent_enabled(&agent_id, enabled).await {
        println!("{}", format!("Could not update {}: {}", name, e).yellow());
    }
}

fn print_members(conversation: &Conversation<TokioCliRunner>) {
    let roster = conversation.courier().roster();
    let members: Vec<String> = roster
        .members()
        .iter()
        .filter(|m| !m.id.is_operator())
        .map(|m| {
            if m.enabled {
                m.display_name.green().to_string()
            } else {
                format!("{} (off)", m.display_name).dimmed().to_string()
            }
        })
        .collect();
    println!("Members: {}", members.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input(" hello @Claude "), Input::Message("hello @Claude".to_string()));
        assert_eq!(parse_input("/step"), Input::ToggleStep);
        assert_eq!(parse_input("/NEXT"), Input::Next);
        assert_eq!(parse_input("/disable  Gemini "), Input::Disable("Gemini".to_string()));
        assert_eq!(parse_input("/enable codex"), Input::Enable("codex".to_string()));
        assert_eq!(parse_input("/enable"), Input::Unknown("/enable".to_string()));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/dance"), Input::Unknown("/dance".to_string()));
    }

    #[test]
    fn test_terminal_host_names() {
        let host = TerminalHost::new("Ada");
        assert_eq!(host.display_name(&ParticipantId::operator()), "Ada");
        assert_eq!(host.display_name(&ParticipantId::from("codex")), "codex");
    }
}
