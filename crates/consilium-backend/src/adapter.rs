//! Backend adapter: one CLI invocation, streamed and classified
//!
//! Stdout is read as JSON lines and interpreted by the backend's event
//! parser. Non-JSON output is buffered and only reported when it looks like
//! a failure; everything else is incidental noise from the CLI.

use serde_json::Value;
use std::ops::ControlFlow;
use tracing::{debug, error, instrument, trace, warn};

use consilium_core::{ConsiliumError, RunSignals};

use crate::classify::{dedupe_preserving_order, is_failure_text, is_overflow_text};
use crate::event::StreamEvent;
use crate::kind::BackendKind;
use crate::observer::TurnObserver;
use crate::process::{AbortFuture, CliInvocation, CliRunner, RawLine, StreamEnd, StreamSink};
use crate::runtime::RuntimeHandle;

/// Classified result of one CLI invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliTurn {
    /// Reply text (final, or the last text seen)
    pub text: String,
    /// De-duplicated error texts, in first-seen order
    pub errors: Vec<String>,
    /// The backend reported context-window exhaustion
    pub overflow: bool,
    /// The backend reported an explicit error event
    pub fatal: bool,
    pub exit_code: Option<i32>,
    /// Torn down by kill, interrupt or shutdown
    pub aborted: bool,
}

impl CliTurn {
    /// Overflow by explicit event or by keyword match
    pub fn is_overflow(&self) -> bool {
        self.overflow
            || self.errors.iter().any(|e| is_overflow_text(e))
            || is_overflow_text(&self.text)
    }

    /// Whether the process exited with a non-zero status
    pub fn exited_with_failure(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }

    /// Whether the stored session should be discarded
    pub fn needs_session_reset(&self) -> bool {
        self.fatal || self.exited_with_failure()
    }

    pub fn combined_error(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("\n"))
        }
    }
}

/// Stream sink that turns backend events into a [`CliTurn`]
struct TurnCollector<'a> {
    backend: BackendKind,
    handle: &'a RuntimeHandle,
    observer: &'a dyn TurnObserver,
    text: String,
    errors: Vec<String>,
    plain: Vec<String>,
    overflow: bool,
    fatal: bool,
    disabled: bool,
}

impl<'a> TurnCollector<'a> {
    fn new(backend: BackendKind, handle: &'a RuntimeHandle, observer: &'a dyn TurnObserver) -> Self {
        Self {
            backend,
            handle,
            observer,
            text: String::new(),
            errors: Vec::new(),
            plain: Vec::new(),
            overflow: false,
            fatal: false,
            disabled: false,
        }
    }

    fn flush_plain(&mut self) {
        if self.plain.is_empty() {
            return;
        }
        let combined = self.plain.join(" ");
        self.plain.clear();
        if is_failure_text(&combined) {
            self.errors.push(combined);
        } else {
            trace!("[{}] Discarding non-protocol output: {}", self.handle.agent_id(), combined);
        }
    }

    fn apply(&mut self, event: StreamEvent) -> ControlFlow<()> {
        let stop = event.is_terminal();
        match event {
            StreamEvent::Session(id) => {
                debug!("[{}] Session id: {}", self.handle.agent_id(), id);
                self.handle.set_session_id(&id);
            }
            StreamEvent::ToolCall { tool, detail } => {
                self.observer.tool_call(self.handle.agent_id(), &tool, &detail);
            }
            StreamEvent::Text(text) => self.text = text,
            StreamEvent::Delta(text) => self.text.push_str(&text),
            StreamEvent::Final(text) => {
                if !text.is_empty() {
                    self.text = text;
                }
            }
            StreamEvent::Complete => {}
            StreamEvent::Overflow(message) => {
                warn!("[{}] Context overflow detected", self.handle.agent_id());
                self.overflow = true;
                self.errors.push(message);
            }
            StreamEvent::Error(message) => {
                error!("[{}] Error event: {}", self.handle.agent_id(), message);
                self.fatal = true;
                self.errors.push(message);
            }
        }
        if stop {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl StreamSink for TurnCollector<'_> {
    fn on_spawn(&mut self, pid: Option<u32>) {
        self.handle.set_pid(pid);
    }

    fn on_line(&mut self, line: RawLine) -> ControlFlow<()> {
        if !self.handle.is_enabled() {
            debug!("[{}] Disabled during processing, stopping read", self.handle.agent_id());
            self.disabled = true;
            return ControlFlow::Break(());
        }

        let line = match line {
            RawLine::Text(line) => line,
            RawLine::NonUtf8(lossy) => {
                error!("[{}] Non UTF-8 output", self.handle.agent_id());
                self.errors.push(format!(
                    "{}: non UTF-8 output ({})",
                    self.handle.display_name(),
                    lossy.trim()
                ));
                return ControlFlow::Continue(());
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ControlFlow::Continue(());
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(event) if event.is_object() => {
                self.flush_plain();
                trace!("[{}] EVENT: {}", self.handle.agent_id(), trimmed);
                for parsed in self.backend.parse_event(&event) {
                    if self.apply(parsed).is_break() {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            }
            _ => {
                self.plain.push(trimmed.to_string());
                ControlFlow::Continue(())
            }
        }
    }
}

/// Run one invocation and classify its outcome
///
/// Never fails: spawn errors and transport problems become error texts.
#[instrument(skip_all, fields(agent = %handle.agent_id()))]
pub(crate) async fn run_cli_turn<R>(
    runner: &R,
    handle: &RuntimeHandle,
    backend: BackendKind,
    invocation: &CliInvocation,
    observer: &dyn TurnObserver,
    signals: &RunSignals,
) -> CliTurn
where
    R: CliRunner + ?Sized,
{
    let display_name = handle.display_name();
    let killed = handle.killed();
    let abort: AbortFuture<'_> = Box::pin(async move {
        tokio::select! {
            _ = killed => {}
            _ = signals.stopped() => {}
        }
    });

    let mut collector = TurnCollector::new(backend, handle, observer);
    let result = runner.run(invocation, &mut collector, abort).await;
    collector.flush_plain();
    handle.set_pid(None);

    let mut turn = CliTurn {
        text: std::mem::take(&mut collector.text),
        overflow: collector.overflow,
        fatal: collector.fatal,
        aborted: collector.disabled,
        ..Default::default()
    };
    let mut errors = std::mem::take(&mut collector.errors);

    match result {
        Err(e) => {
            error!("[{}] {}", handle.agent_id(), e);
            errors.push(format!("{}: error {}", display_name, e));
        }
        Ok(exit) => {
            turn.exit_code = exit.code;
            match &exit.end {
                StreamEnd::Aborted => turn.aborted = true,
                StreamEnd::TimedOut => {
                    let error = ConsiliumError::Timeout(invocation.timeout);
                    error!("[{}] {}", handle.agent_id(), error);
                    errors.push(format!("{}: {}", display_name, error));
                }
                StreamEnd::ReadFailed(reason) => {
                    error!("[{}] Stream read error: {}", handle.agent_id(), reason);
                    errors.push(reason.clone());
                }
                StreamEnd::Eof | StreamEnd::Stopped => {}
            }

            let stderr = exit.stderr.trim();
            if !turn.aborted && !exit.success() && exit.end != StreamEnd::TimedOut {
                if !stderr.is_empty() {
                    error!("[{}] stderr: {}", handle.agent_id(), stderr);
                }
                let text = turn.text.trim();
                if !text.is_empty() {
                    errors.push(text.to_string());
                }
                if !stderr.is_empty() {
                    errors.push(stderr.to_string());
                }
                if text.is_empty() && stderr.is_empty() {
                    errors.push(match exit.code {
                        Some(code) => format!("{}: exit code {}", display_name, code),
                        None => format!("{}: terminated by signal", display_name),
                    });
                }
                if exit.code.is_none() {
                    turn.exit_code = Some(-1);
                }
            } else if !stderr.is_empty() {
                debug!("[{}] stderr: {}", handle.agent_id(), stderr);
            }
        }
    }

    turn.errors = dedupe_preserving_order(errors.into_iter().map(|e| e.trim().to_string()).collect());
    trace!("[{}] RAW RESPONSE: {:?}", handle.agent_id(), turn);
    turn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use crate::process::{MockCliRunner, MockRun, TokioCliRunner};
    use crate::runtime::{AgentRuntime, AgentRuntimeTable};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn invocation() -> CliInvocation {
        CliInvocation {
            program: "codex".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            timeout: Duration::from_secs(5),
            exit_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(10),
            line_limit: 1024,
        }
    }

    fn setup(kind: BackendKind) -> (AgentRuntimeTable, Arc<RuntimeHandle>) {
        let table = AgentRuntimeTable::new();
        let handle = table.register(AgentRuntime::new(kind.id(), "Agent", kind));
        (table, handle)
    }

    #[derive(Default)]
    struct ToolLog(Mutex<Vec<String>>);

    impl TurnObserver for ToolLog {
        fn notice(&self, _notice: consilium_core::Notice) {}

        fn tool_call(&self, _agent: &consilium_core::ParticipantId, tool: &str, detail: &str) {
            self.0.lock().unwrap().push(format!("{} {}", tool, detail));
        }
    }

    #[tokio::test]
    async fn test_codex_reply_and_session() {
        let (_table, handle) = setup(BackendKind::Codex);
        let runner = MockCliRunner::new().with_run(MockRun::events([
            json!({"type": "thread.started", "thread_id": "t-1"}),
            json!({"type": "item.completed", "item": {"type": "command_execution", "status": "completed", "command": "ls"}}),
            json!({"type": "item.completed", "item": {"type": "agent_message", "text": "All good"}}),
            json!({"type": "turn.completed"}),
        ]));
        let tools = ToolLog::default();
        let signals = RunSignals::new();

        let turn = run_cli_turn(&runner, &handle, BackendKind::Codex, &invocation(), &tools, &signals).await;
        assert_eq!(turn.text, "All good");
        assert!(turn.errors.is_empty());
        assert_eq!(handle.session_id().as_deref(), Some("t-1"));
        assert_eq!(*tools.0.lock().unwrap(), vec!["bash ls"]);
    }

    #[tokio::test]
    async fn test_non_json_noise_is_discarded() {
        let (_table, handle) = setup(BackendKind::Gemini);
        let runner = MockCliRunner::new().with_run(MockRun::lines([
            "Loaded cached credentials.".to_string(),
            json!({"type": "message", "role": "assistant", "content": "Hi", "delta": true}).to_string(),
            json!({"type": "message", "role": "assistant", "content": " there", "delta": true}).to_string(),
            json!({"type": "result"}).to_string(),
        ]));
        let turn = run_cli_turn(&runner, &handle, BackendKind::Gemini, &invocation(), &NullObserver, &RunSignals::new()).await;
        assert_eq!(turn.text, "Hi there");
        assert!(turn.errors.is_empty());
    }

    #[tokio::test]
    async fn test_non_json_failure_is_forced_error() {
        let (_table, handle) = setup(BackendKind::Gemini);
        let runner = MockCliRunner::new().with_run(MockRun::lines([
            "Error: quota exceeded",
            "please retry later",
        ]));
        let turn = run_cli_turn(&runner, &handle, BackendKind::Gemini, &invocation(), &NullObserver, &RunSignals::new()).await;
        assert_eq!(turn.errors, vec!["Error: quota exceeded please retry later"]);
        assert!(!turn.needs_session_reset());
    }

    #[tokio::test]
    async fn test_non_zero_exit_collects_text_and_stderr() {
        let (_table, handle) = setup(BackendKind::Claude);
        let runner = MockCliRunner::new()
            .with_run(
                MockRun::events([json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "partial"}]}})])
                    .with_exit(1)
                    .with_stderr("boom\n"),
            )
            .with_run(MockRun::lines(Vec::<String>::new()).with_exit(7))
            .with_run(MockRun::lines(Vec::<String>::new()).with_exit(7).with_stderr("boom"));

        let signals = RunSignals::new();
        let turn = run_cli_turn(&runner, &handle, BackendKind::Claude, &invocation(), &NullObserver, &signals).await;
        assert_eq!(turn.errors, vec!["partial", "boom"]);
        assert!(turn.needs_session_reset());

        let turn = run_cli_turn(&runner, &handle, BackendKind::Claude, &invocation(), &NullObserver, &signals).await;
        assert_eq!(turn.errors, vec!["Agent: exit code 7"]);

        let turn = run_cli_turn(&runner, &handle, BackendKind::Claude, &invocation(), &NullObserver, &signals).await;
        assert_eq!(turn.errors, vec!["boom"]);
    }

    #[tokio::test]
    async fn test_overflow_event() {
        let (_table, handle) = setup(BackendKind::Codex);
        let runner = MockCliRunner::new().with_run(MockRun::events([json!({
            "type": "turn.failed",
            "error": {"message": "This model's maximum context window was exceeded"}
        })]));
        let turn = run_cli_turn(&runner, &handle, BackendKind::Codex, &invocation(), &NullObserver, &RunSignals::new()).await;
        assert!(turn.overflow);
        assert!(turn.is_overflow());
        assert!(!turn.fatal);
    }

    #[tokio::test]
    async fn test_abort_on_kill() {
        let (table, handle) = setup(BackendKind::Codex);
        let runner = MockCliRunner::new().with_run(MockRun::hang());
        let signals = RunSignals::new();

        let killer = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                handle.request_kill();
            })
        };
        let turn = run_cli_turn(&runner, &handle, BackendKind::Codex, &invocation(), &NullObserver, &signals).await;
        killer.await.unwrap();
        assert!(turn.aborted);
        assert!(turn.errors.is_empty());
        drop(table);
    }

    #[tokio::test]
    async fn test_abort_on_interrupt() {
        let (_table, handle) = setup(BackendKind::Codex);
        let runner = MockCliRunner::new().with_run(MockRun::hang());
        let signals = RunSignals::new();
        signals.request_interrupt();

        let turn = tokio::time::timeout(
            Duration::from_secs(1),
            run_cli_turn(&runner, &handle, BackendKind::Codex, &invocation(), &NullObserver, &signals),
        )
        .await
        .unwrap();
        assert!(turn.aborted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_becomes_error_text() {
        let (_table, handle) = setup(BackendKind::Codex);
        let mut invocation = invocation();
        invocation.program = "sh".to_string();
        invocation.args = vec!["-c".to_string(), "sleep 30".to_string()];
        invocation.timeout = Duration::from_millis(100);

        let turn = run_cli_turn(&TokioCliRunner, &handle, BackendKind::Codex, &invocation, &NullObserver, &RunSignals::new()).await;
        assert!(!turn.aborted);
        assert_eq!(turn.errors, vec!["Agent: Agent process timed out after 100ms"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_error_text() {
        let (_table, handle) = setup(BackendKind::Codex);
        let runner = MockCliRunner::new().with_run(MockRun::spawn_failure("codex: not found"));
        let turn = run_cli_turn(&runner, &handle, BackendKind::Codex, &invocation(), &NullObserver, &RunSignals::new()).await;
        assert_eq!(turn.errors.len(), 1);
        assert!(turn.errors[0].starts_with("Agent: error"));
    }
}
