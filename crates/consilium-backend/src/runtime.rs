//! Live per-participant runtime state
//!
//! The registry owns configuration; the runtime table owns what only exists
//! while the process runs: the resumable session id, the prompt cadence
//! counter, the running pid and the per-participant call lock.

use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tracing::{debug, info};

use consilium_core::ParticipantId;

use crate::kind::BackendKind;

/// Snapshot of one participant's runtime state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRuntime {
    pub agent_id: ParticipantId,
    pub display_name: String,
    pub backend: BackendKind,
    /// Executable path; empty means "not configured"
    pub command_path: String,
    pub role_id: Option<String>,
    pub enabled: bool,
    pub session_id: Option<String>,
    pub message_count: u64,
    /// Messages since the system prompt was last included
    pub prompt_counter: u32,
    pub pid: Option<u32>,
}

impl AgentRuntime {
    pub fn new(agent_id: impl Into<ParticipantId>, display_name: &str, backend: BackendKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.to_string(),
            backend,
            command_path: backend.default_executable().to_string(),
            role_id: None,
            enabled: true,
            session_id: None,
            message_count: 0,
            prompt_counter: 0,
            pid: None,
        }
    }

    pub fn with_command(mut self, command_path: &str) -> Self {
        self.command_path = command_path.to_string();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_role(mut self, role_id: Option<String>) -> Self {
        self.role_id = role_id;
        self
    }

    pub fn with_session(mut self, session_id: Option<String>, message_count: u64) -> Self {
        self.session_id = session_id;
        self.message_count = message_count;
        self
    }
}

/// Shared handle to one participant's runtime
#[derive(Debug)]
pub struct RuntimeHandle {
    agent_id: ParticipantId,
    state: Mutex<AgentRuntime>,
    call_lock: AsyncMutex<()>,
    kill: Notify,
}

impl RuntimeHandle {
    fn new(runtime: AgentRuntime) -> Self {
        Self {
            agent_id: runtime.agent_id.clone(),
            state: Mutex::new(runtime),
            call_lock: AsyncMutex::new(()),
            kill: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &ParticipantId {
        &self.agent_id
    }

    pub fn snapshot(&self) -> AgentRuntime {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run `f` with the state locked
    pub fn with_state<T>(&self, f: impl FnOnce(&mut AgentRuntime) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|s| s.enabled)
    }

    pub fn display_name(&self) -> String {
        self.with_state(|s| s.display_name.clone())
    }

    /// Returns true if the flag changed
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.with_state(|s| std::mem::replace(&mut s.enabled, enabled) != enabled)
    }

    pub fn session_id(&self) -> Option<String> {
        self.with_state(|s| s.session_id.clone())
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.with_state(|s| s.session_id = Some(session_id.to_string()));
    }

    /// Forget the session; the next turn starts fresh with the preamble
    pub fn clear_session(&self) {
        self.with_state(|s| {
            s.session_id = None;
            s.prompt_counter = 0;
        });
    }

    /// Returns the new count
    pub fn increment_message_count(&self) -> u64 {
        self.with_state(|s| {
            s.message_count += 1;
            s.message_count
        })
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.with_state(|s| s.pid = pid);
    }

    /// Ask any in-flight invocation to stop
    pub fn request_kill(&self) {
        self.kill.notify_waiters();
    }

    /// Resolves on the next [`request_kill`](Self::request_kill) after this call
    pub fn killed(&self) -> Notified<'_> {
        self.kill.notified()
    }

    /// Serialize dispatches to this participant
    pub async fn lock_call(&self) -> AsyncMutexGuard<'_, ()> {
        self.call_lock.lock().await
    }
}

/// All participants' runtime state, in registration order
#[derive(Debug, Default)]
pub struct AgentRuntimeTable {
    handles: RwLock<Vec<Arc<RuntimeHandle>>>,
}

impl AgentRuntimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant, or refresh the configuration of an existing one
    ///
    /// Refreshing keeps the live session, counters and pid.
    pub fn register(&self, runtime: AgentRuntime) -> Arc<RuntimeHandle> {
        let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.iter().find(|h| h.agent_id == runtime.agent_id) {
            handle.with_state(|state| {
                state.display_name = runtime.display_name;
                state.backend = runtime.backend;
                state.command_path = runtime.command_path;
                state.role_id = runtime.role_id;
                state.enabled = runtime.enabled;
            });
            debug!("Refreshed runtime for {}", handle.agent_id);
            return Arc::clone(handle);
        }

        info!("Registered participant {} ({})", runtime.agent_id, runtime.backend);
        let handle = Arc::new(RuntimeHandle::new(runtime));
        handles.push(Arc::clone(&handle));
        handle
    }

    /// Remove a participant, stopping any in-flight invocation
    pub fn remove(&self, agent_id: &ParticipantId) -> Option<Arc<RuntimeHandle>> {
        let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
        let index = handles.iter().position(|h| &h.agent_id == agent_id)?;
        let handle = handles.remove(index);
        handle.request_kill();
        info!("Removed participant {}", agent_id);
        Some(handle)
    }

    pub fn get(&self, agent_id: &ParticipantId) -> Option<Arc<RuntimeHandle>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|h| &h.agent_id == agent_id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.agent_id.clone())
            .collect()
    }

    pub fn enabled_ids(&self) -> Vec<ParticipantId> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.is_enabled())
            .map(|h| h.agent_id.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<AgentRuntime> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.snapshot())
            .collect()
    }

    pub fn display_name(&self, agent_id: &ParticipantId) -> Option<String> {
        self.get(agent_id).map(|h| h.display_name())
    }

    pub fn is_enabled(&self, agent_id: &ParticipantId) -> bool {
        self.get(agent_id).is_some_and(|h| h.is_enabled())
    }

    /// Toggle participation; disabling stops any in-flight invocation
    ///
    /// Returns true if the flag changed.
    pub fn set_enabled(&self, agent_id: &ParticipantId, enabled: bool) -> bool {
        let Some(handle) = self.get(agent_id) else {
            return false;
        };
        let changed = handle.set_enabled(enabled);
        if !enabled {
            handle.request_kill();
        }
        changed
    }

    /// Stop every in-flight invocation
    pub fn kill_all(&self) {
        for handle in self.handles.read().unwrap_or_else(|e| e.into_inner()).iter() {
            handle.request_kill();
        }
    }

    /// Display names of enabled participants, excluding `exclude`
    pub fn participant_names(&self, exclude: &ParticipantId) -> Vec<String> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| &h.agent_id != exclude && h.is_enabled())
            .map(|h| h.display_name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn codex() -> AgentRuntime {
        AgentRuntime::new("codex", "Codex", BackendKind::Codex)
    }

    #[test]
    fn test_register_keeps_order_and_live_state() {
        let table = AgentRuntimeTable::new();
        table.register(codex());
        table.register(AgentRuntime::new("claude", "Claude", BackendKind::Claude));

        let handle = table.get(&"codex".into()).unwrap();
        handle.set_session_id("thread-1");
        handle.increment_message_count();

        table.register(codex().with_command("/opt/codex").with_enabled(false));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.session_id.as_deref(), Some("thread-1"));
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.command_path, "/opt/codex");
        assert!(!snapshot.enabled);

        let ids: Vec<String> = table.ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["codex", "claude"]);
        assert_eq!(table.enabled_ids().len(), 1);
    }

    #[test]
    fn test_clear_session_resets_counter() {
        let table = AgentRuntimeTable::new();
        let handle = table.register(codex());
        handle.set_session_id("s");
        handle.with_state(|s| s.prompt_counter = 5);
        handle.clear_session();
        let snapshot = handle.snapshot();
        assert!(snapshot.session_id.is_none());
        assert_eq!(snapshot.prompt_counter, 0);
    }

    #[test]
    fn test_participant_names_exclude_self_and_disabled() {
        let table = AgentRuntimeTable::new();
        table.register(codex());
        table.register(AgentRuntime::new("claude", "Claude", BackendKind::Claude));
        table.register(AgentRuntime::new("gemini", "Gemini", BackendKind::Gemini).with_enabled(false));

        assert_eq!(table.participant_names(&"codex".into()), vec!["Claude"]);
    }

    #[tokio::test]
    async fn test_disable_wakes_killed_waiter() {
        let table = Arc::new(AgentRuntimeTable::new());
        let handle = table.register(codex());

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.killed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(table.set_enabled(&"codex".into(), false));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!table.set_enabled(&"codex".into(), false));
    }

    #[test]
    fn test_remove() {
        let table = AgentRuntimeTable::new();
        table.register(codex());
        assert!(table.remove(&"codex".into()).is_some());
        assert!(table.remove(&"codex".into()).is_none());
        assert!(table.get(&"codex".into()).is_none());
    }
}
