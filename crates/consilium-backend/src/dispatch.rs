//! Dispatch controller: one participant turn, with compaction and retry
//!
//! Wraps the backend adapter. Context overflow triggers exactly one recovery
//! action (compaction, or a session reset where compaction is unavailable)
//! followed by one retry. Fatal errors clear the stored session so the next
//! turn starts clean. Nothing here returns an error: every failure resolves
//! to a [`TurnOutcome`].

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

use consilium_core::fail_open::fail_open;
use consilium_core::prompts::COMPACT_PROMPT;
use consilium_core::{ConsiliumConfig, ConsiliumError, Notice, ParticipantId, PromptConfig, RunSignals, RuntimeConfig};
use consilium_store::SessionStore;

use crate::adapter::{run_cli_turn, CliTurn};
use crate::classify::is_silent_response;
use crate::kind::BackendKind;
use crate::observer::TurnObserver;
use crate::process::{CliInvocation, CliRunner};
use crate::prompt::{compose_prompt, expand_command_path, system_text, SystemPromptPolicy};
use crate::runtime::{AgentRuntimeTable, RuntimeHandle};

/// Settings the controller needs from the workspace configuration
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Working directory of every CLI invocation
    pub workspace: PathBuf,
    pub prompts: PromptConfig,
    pub runtime: RuntimeConfig,
}

impl DispatchSettings {
    pub fn new(workspace: impl Into<PathBuf>, config: &ConsiliumConfig) -> Self {
        Self {
            workspace: workspace.into(),
            prompts: config.prompts.clone(),
            runtime: config.runtime.clone(),
        }
    }
}

/// One turn for one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub agent_id: ParticipantId,
    /// Formatted context to deliver
    pub message: String,
    pub is_init: bool,
    /// Display names for the participants line
    pub participants: Vec<String>,
    pub role_prompt: Option<String>,
}

impl TurnRequest {
    pub fn new(agent_id: impl Into<ParticipantId>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            message: message.into(),
            is_init: false,
            participants: Vec::new(),
            role_prompt: None,
        }
    }

    pub fn init(mut self, is_init: bool) -> Self {
        self.is_init = is_init;
        self
    }

    pub fn with_participants(mut self, participants: Vec<String>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_role_prompt(mut self, role_prompt: Option<String>) -> Self {
        self.role_prompt = role_prompt;
        self
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent replied
    Reply(String),
    /// The turn produced error text worth posting as an error-flagged entry
    ErrorReply(String),
    /// The agent chose not to speak
    Silent,
    /// Nothing ran to completion: stopped, interrupted or disabled
    Skipped,
    /// Terminal failure with no message
    Failed(String),
}

enum Recovery {
    Compacted,
    Reset,
    Failed,
    Aborted,
}

/// Drives turns through a [`CliRunner`]
pub struct DispatchController<R: CliRunner> {
    runner: Arc<R>,
    store: Arc<dyn SessionStore>,
    runtimes: Arc<AgentRuntimeTable>,
    signals: Arc<RunSignals>,
    settings: DispatchSettings,
    policy: SystemPromptPolicy,
}

impl<R: CliRunner> DispatchController<R> {
    pub fn new(
        runner: Arc<R>,
        store: Arc<dyn SessionStore>,
        runtimes: Arc<AgentRuntimeTable>,
        signals: Arc<RunSignals>,
        settings: DispatchSettings,
    ) -> Self {
        let policy = SystemPromptPolicy::new(settings.prompts.system_prompt_period);
        Self {
            runner,
            store,
            runtimes,
            signals,
            settings,
            policy,
        }
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    pub fn runtimes(&self) -> &Arc<AgentRuntimeTable> {
        &self.runtimes
    }

    pub fn signals(&self) -> &Arc<RunSignals> {
        &self.signals
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run one turn to a [`TurnOutcome`]
    ///
    /// Calls for the same participant are serialized behind its call lock.
    #[instrument(skip(self, request, observer), fields(agent = %request.agent_id))]
    pub async fn dispatch(&self, request: &TurnRequest, observer: &dyn TurnObserver) -> TurnOutcome {
        let Some(handle) = self.runtimes.get(&request.agent_id) else {
            warn!("Dispatch to unknown participant {}", request.agent_id);
            return TurnOutcome::Failed(format!("unknown participant {}", request.agent_id));
        };

        let _call = handle.lock_call().await;

        if self.signals.should_stop() {
            debug!("Shutdown/interrupt in progress; skipping request");
            return TurnOutcome::Skipped;
        }
        if !handle.is_enabled() {
            debug!("{} is disabled; skipping request", request.agent_id);
            return TurnOutcome::Skipped;
        }

        let snapshot = handle.snapshot();
        let display_name = snapshot.display_name.clone();
        let backend = snapshot.backend;

        let command = expand_command_path(&snapshot.command_path);
        if command.is_empty() {
            let error = ConsiliumError::CommandNotConfigured(display_name.clone());
            warn!("{}", error);
            observer.notice(Notice::CommandNotConfigured {
                display_name: display_name.clone(),
            });
            return TurnOutcome::Failed(error.to_string());
        }

        let mut prompt = self.build_prompt(&handle, request, false);
        let mut compacted = false;

        loop {
            if self.signals.should_stop() {
                return TurnOutcome::Skipped;
            }

            let session_id = handle.session_id();
            let invocation = self.invocation(&command, backend.build_args(&prompt, session_id.as_deref()));
            debug!(
                "Running {} ({}, {})",
                command,
                backend,
                if session_id.is_some() { "resume" } else { "fresh" }
            );

            let turn = run_cli_turn(
                self.runner.as_ref(),
                &handle,
                backend,
                &invocation,
                observer,
                &self.signals,
            )
            .await;

            if turn.aborted || !handle.is_enabled() {
                info!("Turn for {} was stopped before completion", request.agent_id);
                return TurnOutcome::Skipped;
            }

            if turn.is_overflow() {
                if compacted {
                    warn!("Compact retry limit reached for {}", request.agent_id);
                    return TurnOutcome::Failed(format!(
                        "{}: context overflow persisted after recovery",
                        display_name
                    ));
                }
                compacted = true;
                observer.notice(Notice::ContextOverflow {
                    display_name: display_name.clone(),
                });

                match self.recover_overflow(&handle, backend, &command, observer).await {
                    Recovery::Compacted => continue,
                    Recovery::Reset => {
                        prompt = self.build_prompt(&handle, request, true);
                        continue;
                    }
                    Recovery::Failed => {
                        return TurnOutcome::Failed(format!(
                            "{}: failed to compact context",
                            display_name
                        ))
                    }
                    Recovery::Aborted => return TurnOutcome::Skipped,
                }
            }

            return self.finish(&handle, &display_name, turn, observer).await;
        }
    }

    async fn finish(
        &self,
        handle: &RuntimeHandle,
        display_name: &str,
        turn: CliTurn,
        observer: &dyn TurnObserver,
    ) -> TurnOutcome {
        if turn.needs_session_reset() {
            warn!("Resetting session for {}", handle.agent_id());
            handle.clear_session();
            self.persist_session(handle).await;
            observer.notice(Notice::SessionReset {
                display_name: display_name.to_string(),
            });
        }

        if let Some(error) = turn.combined_error() {
            return TurnOutcome::ErrorReply(error);
        }

        if is_silent_response(&turn.text) {
            debug!("{} stayed silent", handle.agent_id());
            return TurnOutcome::Silent;
        }

        if handle.session_id().is_some() {
            handle.increment_message_count();
            self.persist_session(handle).await;
        }

        TurnOutcome::Reply(turn.text.trim().to_string())
    }

    async fn recover_overflow(
        &self,
        handle: &RuntimeHandle,
        backend: BackendKind,
        command: &str,
        observer: &dyn TurnObserver,
    ) -> Recovery {
        let display_name = handle.display_name();

        let session_id = match handle.session_id() {
            Some(id) if backend.supports_compaction() => id,
            _ => {
                info!("Resetting session for {} after overflow", handle.agent_id());
                handle.clear_session();
                self.persist_session(handle).await;
                observer.notice(Notice::SessionReset { display_name });
                return Recovery::Reset;
            }
        };

        info!("Compacting session {} for {}", session_id, handle.agent_id());
        let invocation = self.invocation(command, backend.build_args(COMPACT_PROMPT, Some(&session_id)));
        let turn = run_cli_turn(
            self.runner.as_ref(),
            handle,
            backend,
            &invocation,
            observer,
            &self.signals,
        )
        .await;

        if turn.aborted {
            return Recovery::Aborted;
        }

        if turn.errors.is_empty() && !turn.overflow && !turn.fatal {
            observer.notice(Notice::CompactSucceeded { display_name });
            Recovery::Compacted
        } else {
            warn!("Compaction failed for {}: {:?}", handle.agent_id(), turn.errors);
            handle.clear_session();
            self.persist_session(handle).await;
            observer.notice(Notice::CompactFailed { display_name });
            Recovery::Failed
        }
    }

    fn build_prompt(&self, handle: &RuntimeHandle, request: &TurnRequest, force: bool) -> String {
        let include = force
            || handle.with_state(|state| {
                self.policy
                    .should_include(&mut state.prompt_counter, request.is_init)
            });

        if !include {
            trace!("[{}] Skipping system prompts", request.agent_id);
            return request.message.clone();
        }

        let participants = if request.participants.is_empty() {
            self.runtimes.participant_names(&request.agent_id)
        } else {
            request.participants.clone()
        };
        let system = system_text(
            &self.settings.prompts,
            request.role_prompt.as_deref(),
            request.is_init,
        );
        let prompt = compose_prompt(&handle.display_name(), &participants, &system, &request.message);
        trace!("[{}] Including system prompts", request.agent_id);
        prompt
    }

    fn invocation(&self, command: &str, args: Vec<String>) -> CliInvocation {
        let runtime = &self.settings.runtime;
        CliInvocation {
            program: command.to_string(),
            args,
            cwd: self.settings.workspace.clone(),
            timeout: runtime.cli_timeout(),
            exit_timeout: runtime.exit_timeout(),
            shutdown_grace: runtime.shutdown_grace(),
            line_limit: runtime.stream_line_limit_bytes,
        }
    }

    async fn persist_session(&self, handle: &RuntimeHandle) {
        let snapshot = handle.snapshot();
        fail_open("session_save", || {
            self.store.save_session(
                snapshot.agent_id.as_str(),
                snapshot.session_id.as_deref(),
                snapshot.message_count,
            )
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockCliRunner, MockRun};
    use crate::runtime::AgentRuntime;
    use consilium_store::MemorySessionStore;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Notices(Mutex<Vec<Notice>>);

    impl TurnObserver for Notices {
        fn notice(&self, notice: Notice) {
            self.0.lock().unwrap().push(notice);
        }
    }

    impl Notices {
        fn all(&self) -> Vec<Notice> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Fixture {
        runner: Arc<MockCliRunner>,
        store: Arc<MemorySessionStore>,
        runtimes: Arc<AgentRuntimeTable>,
        signals: Arc<RunSignals>,
        controller: DispatchController<MockCliRunner>,
    }

    fn fixture(kind: BackendKind, runs: Vec<MockRun>) -> Fixture {
        let runner = Arc::new(MockCliRunner::new());
        for run in runs {
            runner.push(run);
        }
        let store = Arc::new(MemorySessionStore::new());
        let runtimes = Arc::new(AgentRuntimeTable::new());
        runtimes.register(AgentRuntime::new(kind.id(), "Agent", kind));
        let signals = Arc::new(RunSignals::new());
        let settings = DispatchSettings::new(std::env::temp_dir(), &ConsiliumConfig::default());
        let controller = DispatchController::new(
            Arc::clone(&runner),
            store.clone(),
            Arc::clone(&runtimes),
            Arc::clone(&signals),
            settings,
        );
        Fixture {
            runner,
            store,
            runtimes,
            signals,
            controller,
        }
    }

    fn codex_overflow() -> MockRun {
        MockRun::events([
            json!({"type": "thread.started", "thread_id": "t-1"}),
            json!({"type": "turn.failed", "error": {"message": "context window exceeded"}}),
        ])
    }

    #[tokio::test]
    async fn test_reply_persists_session_and_count() {
        let fx = fixture(
            BackendKind::Codex,
            vec![MockRun::events([
                json!({"type": "thread.started", "thread_id": "t-1"}),
                json!({"type": "item.completed", "item": {"type": "agent_message", "text": " hello "}}),
            ])],
        );

        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &Notices::default())
            .await;
        assert_eq!(outcome, TurnOutcome::Reply("hello".to_string()));

        let saved = fx.store.session("codex").unwrap();
        assert_eq!(saved.session_id.as_deref(), Some("t-1"));
        assert_eq!(saved.message_count, 1);
    }

    #[tokio::test]
    async fn test_resume_uses_stored_session() {
        let fx = fixture(
            BackendKind::Codex,
            vec![MockRun::events([
                json!({"type": "item.completed", "item": {"type": "agent_message", "text": "ok"}}),
            ])],
        );
        fx.runtimes.get(&"codex".into()).unwrap().set_session_id("t-9");

        fx.controller
            .dispatch(&TurnRequest::new("codex", "hi"), &Notices::default())
            .await;
        let args = &fx.runner.invocations()[0].args;
        assert!(args.windows(2).any(|w| w == ["resume", "t-9"]));
    }

    #[tokio::test]
    async fn test_init_turn_carries_preamble() {
        let fx = fixture(BackendKind::Claude, vec![MockRun::lines(["....."])]);
        let request = TurnRequest::new("claude", "Hello! Introduce yourself briefly (one sentence).")
            .init(true)
            .with_participants(vec!["User".to_string()])
            .with_role_prompt(Some("You are the architect.".to_string()));

        let outcome = fx.controller.dispatch(&request, &Notices::default()).await;
        assert_eq!(outcome, TurnOutcome::Silent);

        let prompt = &fx.runner.invocations()[0].args[1];
        assert!(prompt.starts_with("Your name is Agent."));
        assert!(prompt.contains("You are the architect."));
        assert!(prompt.contains("FIRST INTRODUCTION"));
    }

    #[tokio::test]
    async fn test_codex_overflow_compacts_once_then_fails() {
        let fx = fixture(
            BackendKind::Codex,
            vec![
                codex_overflow(),
                MockRun::events([json!({"type": "item.completed", "item": {"type": "agent_message", "text": "compacted"}})]),
                codex_overflow(),
            ],
        );
        let notices = Notices::default();

        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &notices)
            .await;
        assert!(matches!(outcome, TurnOutcome::Failed(_)));

        let invocations = fx.runner.invocations();
        assert_eq!(invocations.len(), 3);
        assert_eq!(invocations[1].args.last().map(String::as_str), Some(COMPACT_PROMPT));
        assert!(notices.all().contains(&Notice::CompactSucceeded {
            display_name: "Agent".to_string()
        }));
        assert_eq!(fx.runner.remaining(), 0);
    }

    #[tokio::test]
    async fn test_codex_overflow_then_success() {
        let fx = fixture(
            BackendKind::Codex,
            vec![
                codex_overflow(),
                MockRun::events([json!({"type": "item.completed", "item": {"type": "agent_message", "text": "done"}})]),
                MockRun::events([json!({"type": "item.completed", "item": {"type": "agent_message", "text": "answer"}})]),
            ],
        );
        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &Notices::default())
            .await;
        assert_eq!(outcome, TurnOutcome::Reply("answer".to_string()));
    }

    #[tokio::test]
    async fn test_failed_compaction_resets_session() {
        let fx = fixture(
            BackendKind::Codex,
            vec![codex_overflow(), MockRun::lines(Vec::<String>::new()).with_exit(1)],
        );
        let notices = Notices::default();
        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &notices)
            .await;

        assert!(matches!(outcome, TurnOutcome::Failed(_)));
        assert!(fx.runtimes.get(&"codex".into()).unwrap().session_id().is_none());
        assert!(notices.all().contains(&Notice::CompactFailed {
            display_name: "Agent".to_string()
        }));
    }

    #[tokio::test]
    async fn test_gemini_overflow_resets_and_retries_once() {
        let overflow = || {
            MockRun::events([
                json!({"type": "system", "session_id": "g-1"}),
                json!({"type": "error", "error": "Request exceeds the maximum context length"}),
            ])
        };
        let fx = fixture(BackendKind::Gemini, vec![overflow(), overflow()]);
        let notices = Notices::default();

        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("gemini", "hi"), &notices)
            .await;
        assert!(matches!(outcome, TurnOutcome::Failed(_)));

        let invocations = fx.runner.invocations();
        assert_eq!(invocations.len(), 2);
        assert!(!invocations[1].args.contains(&"--resume".to_string()));
        assert!(invocations[1].args[1].starts_with("Your name is Agent."));
        assert!(notices.all().contains(&Notice::SessionReset {
            display_name: "Agent".to_string()
        }));
    }

    #[tokio::test]
    async fn test_fatal_error_resets_session() {
        let fx = fixture(
            BackendKind::Codex,
            vec![MockRun::events([
                json!({"type": "thread.started", "thread_id": "t-1"}),
                json!({"type": "error", "message": "stream disconnected"}),
            ])],
        );
        let notices = Notices::default();
        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &notices)
            .await;

        assert_eq!(outcome, TurnOutcome::ErrorReply("stream disconnected".to_string()));
        assert!(fx.runtimes.get(&"codex".into()).unwrap().session_id().is_none());
        assert_eq!(fx.store.session("codex").unwrap().session_id, None);
        assert!(notices.all().contains(&Notice::SessionReset {
            display_name: "Agent".to_string()
        }));
    }

    #[tokio::test]
    async fn test_missing_command_reports_notice() {
        let fx = fixture(BackendKind::Codex, Vec::new());
        fx.runtimes
            .register(AgentRuntime::new("codex", "Agent", BackendKind::Codex).with_command("  "));
        let notices = Notices::default();

        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &notices)
            .await;
        assert_eq!(
            outcome,
            TurnOutcome::Failed("CLI command path is not configured for Agent".to_string())
        );
        assert_eq!(
            notices.all(),
            vec![Notice::CommandNotConfigured {
                display_name: "Agent".to_string()
            }]
        );
        assert!(fx.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_when_stopping_or_disabled() {
        let fx = fixture(BackendKind::Codex, Vec::new());
        fx.signals.request_interrupt();
        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &Notices::default())
            .await;
        assert_eq!(outcome, TurnOutcome::Skipped);

        fx.signals.clear_interrupt();
        fx.runtimes.set_enabled(&"codex".into(), false);
        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &Notices::default())
            .await;
        assert_eq!(outcome, TurnOutcome::Skipped);
        assert!(fx.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_disable_during_turn_discards_reply() {
        let fx = fixture(BackendKind::Codex, vec![MockRun::hang()]);
        let runtimes = Arc::clone(&fx.runtimes);
        let disabler = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            runtimes.set_enabled(&"codex".into(), false);
        });

        let outcome = fx
            .controller
            .dispatch(&TurnRequest::new("codex", "hi"), &Notices::default())
            .await;
        disabler.await.unwrap();
        assert_eq!(outcome, TurnOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_periodic_preamble() {
        let reply = || MockRun::events([json!({"type": "result", "result": "ok"})]);
        let fx = fixture(BackendKind::Claude, vec![reply(), reply(), reply()]);
        let mut config = ConsiliumConfig::default();
        config.prompts.system_prompt_period = 2;
        let controller = DispatchController::new(
            Arc::clone(&fx.runner),
            fx.store.clone(),
            Arc::clone(&fx.runtimes),
            Arc::clone(&fx.signals),
            DispatchSettings::new(std::env::temp_dir(), &config),
        );

        for _ in 0..3 {
            controller
                .dispatch(&TurnRequest::new("claude", "msg"), &Notices::default())
                .await;
        }
        let prompts: Vec<bool> = fx
            .runner
            .invocations()
            .iter()
            .map(|i| i.args[1].starts_with("Your name is"))
            .collect();
        assert_eq!(prompts, vec![false, true, false]);
    }
}
