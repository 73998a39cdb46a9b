//! Shared fixtures for courier and conversation integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use consilium_backend::{
    AgentRuntime, AgentRuntimeTable, BackendKind, CliInvocation, DispatchController, DispatchSettings,
    MockCliRunner, MockRun, TurnObserver,
};
use consilium_core::{ConsiliumConfig, JournalEntry, Notice, ParticipantId, RunSignals};
use consilium_courier::{Courier, CourierCollaborator, CourierOptions, StepGate};
use consilium_store::MemorySessionStore;

/// Host that records everything the courier reports
#[derive(Default)]
pub struct RecordingHost {
    notices: Mutex<Vec<Notice>>,
    entries: Mutex<Vec<JournalEntry>>,
}

impl RecordingHost {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn has_notice(&self, notice: &Notice) -> bool {
        self.notices.lock().unwrap().contains(notice)
    }
}

impl TurnObserver for RecordingHost {
    fn notice(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

#[async_trait]
impl CourierCollaborator for RecordingHost {
    async fn publish_entry(&self, entry: &JournalEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

/// Claude-style reply carrying `text` as its final result
pub fn reply(text: &str) -> MockRun {
    MockRun::events([json!({"type": "result", "subtype": "success", "result": text})])
}

/// Run that prints nothing and exits cleanly (the agent stays silent)
pub fn quiet() -> MockRun {
    MockRun::default().with_exit(0)
}

/// Prompt passed to a `-p <prompt>` style invocation
pub fn prompt_of(invocation: &CliInvocation) -> &str {
    invocation.args.get(1).map(String::as_str).unwrap_or_default()
}

/// Invocations addressed to one agent's command
pub fn invocations_for(runner: &MockCliRunner, agent: &str) -> Vec<CliInvocation> {
    let program = format!("{}-cli", agent);
    runner
        .invocations()
        .into_iter()
        .filter(|i| i.program == program)
        .collect()
}

/// Poll until `condition` holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub struct Fixture {
    pub runner: Arc<MockCliRunner>,
    pub store: Arc<MemorySessionStore>,
    pub runtimes: Arc<AgentRuntimeTable>,
    pub signals: Arc<RunSignals>,
    pub host: Arc<RecordingHost>,
    pub courier: Arc<Courier<MockCliRunner>>,
}

/// Courier over `(id, display name)` agents, all speaking the Claude protocol
///
/// Each agent's command is `<id>-cli` so invocations can be told apart.
pub fn fixture(agents: &[(&str, &str)], step_mode: bool) -> Fixture {
    let runner = Arc::new(MockCliRunner::new());
    let store = Arc::new(MemorySessionStore::new());
    let runtimes = Arc::new(AgentRuntimeTable::new());
    for (id, name) in agents {
        runtimes.register(
            AgentRuntime::new(*id, name, BackendKind::Claude).with_command(&format!("{}-cli", id)),
        );
    }
    let signals = Arc::new(RunSignals::new());
    let dispatcher = Arc::new(DispatchController::new(
        Arc::clone(&runner),
        store.clone(),
        Arc::clone(&runtimes),
        Arc::clone(&signals),
        DispatchSettings::new(std::env::temp_dir(), &ConsiliumConfig::default()),
    ));
    let gate = Arc::new(StepGate::new(step_mode, Arc::clone(&signals)));
    let host = Arc::new(RecordingHost::default());
    let courier = Arc::new(Courier::new(
        dispatcher,
        host.clone(),
        gate,
        CourierOptions::default(),
    ));
    Fixture {
        runner,
        store,
        runtimes,
        signals,
        host,
        courier,
    }
}

pub fn trio() -> Fixture {
    fixture(&[("codex", "Codex"), ("claude", "Claude"), ("gemini", "Gemini")], false)
}

pub fn ids(names: &[&str]) -> Vec<ParticipantId> {
    names.iter().map(|n| ParticipantId::from(*n)).collect()
}

/// Write a settings file whose members all use the Claude protocol
pub fn write_members(workspace: &Path, members: &[(&str, &str, bool)]) {
    let members: Vec<_> = members
        .iter()
        .map(|(id, name, enabled)| {
            json!({
                "id": id,
                "handler": "claude",
                "display_name": name,
                "default_executable": format!("{}-cli", id),
                "default_enabled": enabled,
            })
        })
        .collect();
    let dir = workspace.join(".consilium");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("settings.json"),
        serde_json::to_string_pretty(&json!({ "members": members })).unwrap(),
    )
    .unwrap();
}
