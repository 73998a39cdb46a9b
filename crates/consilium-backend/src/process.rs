//! Agent CLI subprocess execution
//!
//! [`CliRunner`] abstracts launching one agent CLI invocation and streaming
//! its stdout line by line, so the dispatch protocol can be exercised with
//! [`MockCliRunner`] in tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use consilium_core::{ConsiliumError, Result};

/// How long to wait for a killed process to be reaped
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long to wait for the stderr collector after exit
const STDERR_WAIT: Duration = Duration::from_secs(1);

/// Pid reported by the mock runner
const MOCK_PID: u32 = 4242;

/// One CLI invocation
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Wall-clock limit for the whole stream read
    pub timeout: Duration,
    /// Wait for exit after the stream ends normally
    pub exit_timeout: Duration,
    /// Wait for exit after an abort or timeout before killing
    pub shutdown_grace: Duration,
    /// Longest accepted stdout line in bytes
    pub line_limit: usize,
}

/// One stdout line, newline stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Text(String),
    /// Line was not valid UTF-8 (lossy decoding attached)
    NonUtf8(String),
}

/// Why the stdout read stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// stdout closed
    Eof,
    /// The sink asked to stop
    Stopped,
    TimedOut,
    /// The abort future resolved (kill, interrupt, shutdown)
    Aborted,
    ReadFailed(String),
}

/// Result of one finished invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliExit {
    /// Exit code, `None` when killed or never reaped
    pub code: Option<i32>,
    pub stderr: String,
    pub end: StreamEnd,
}

impl CliExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Consumer of a running invocation's output
pub trait StreamSink: Send {
    /// Called once the process is running
    fn on_spawn(&mut self, pid: Option<u32>) {
        let _ = pid;
    }

    /// Called for every stdout line; `Break` stops reading
    fn on_line(&mut self, line: RawLine) -> ControlFlow<()>;
}

/// Future that resolves when the invocation must be torn down
pub type AbortFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for running agent CLIs (allows mocking in tests)
#[async_trait]
pub trait CliRunner: Send + Sync {
    /// Run one invocation to completion
    ///
    /// Returns `Err` only when the process could not be started; every other
    /// outcome is described by [`CliExit`].
    async fn run(
        &self,
        invocation: &CliInvocation,
        sink: &mut dyn StreamSink,
        abort: AbortFuture<'_>,
    ) -> Result<CliExit>;
}

/// Real subprocess runner backed by `tokio::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCliRunner;

#[async_trait]
impl CliRunner for TokioCliRunner {
    #[instrument(skip_all, fields(program = %invocation.program))]
    async fn run(
        &self,
        invocation: &CliInvocation,
        sink: &mut dyn StreamSink,
        mut abort: AbortFuture<'_>,
    ) -> Result<CliExit> {
        debug!("Spawning {} with {} args", invocation.program, invocation.args.len());

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConsiliumError::Spawn(format!("{}: {}", invocation.program, e)))?;

        sink.on_spawn(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConsiliumError::Spawn("stdout was not captured".to_string()))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut bytes = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut bytes).await {
                    debug!("Failed to read stderr: {}", e);
                }
                String::from_utf8_lossy(&bytes).into_owned()
            })
        });

        let mut reader = BufReader::new(stdout);
        let deadline = tokio::time::sleep(invocation.timeout);
        tokio::pin!(deadline);

        let end = loop {
            let mut buf = Vec::new();
            let read = tokio::select! {
                read = read_line_limited(&mut reader, &mut buf, invocation.line_limit) => read,
                _ = &mut deadline => break StreamEnd::TimedOut,
                _ = &mut abort => break StreamEnd::Aborted,
            };
            match read {
                Ok(0) => break StreamEnd::Eof,
                Ok(_) => {
                    if sink.on_line(decode_line(buf)).is_break() {
                        break StreamEnd::Stopped;
                    }
                }
                Err(e) => break StreamEnd::ReadFailed(e.to_string()),
            }
        };
        drop(reader);

        let status = match end {
            StreamEnd::Aborted | StreamEnd::TimedOut => {
                debug!("Stopping {} ({:?})", invocation.program, end);
                terminate(&mut child, invocation.shutdown_grace).await
            }
            _ => match timeout(invocation.exit_timeout, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!("Failed to wait for {}: {}", invocation.program, e);
                    None
                }
                Err(_) => {
                    warn!(
                        "{} did not exit within {:?}, killing",
                        invocation.program, invocation.exit_timeout
                    );
                    terminate(&mut child, Duration::ZERO).await
                }
            },
        };

        let stderr = match stderr_task {
            Some(mut task) => match timeout(STDERR_WAIT, &mut task).await {
                Ok(Ok(text)) => text,
                Ok(Err(_)) => String::new(),
                Err(_) => {
                    task.abort();
                    String::new()
                }
            },
            None => String::new(),
        };

        Ok(CliExit {
            code: status.and_then(|s| s.code()),
            stderr,
            end,
        })
    }
}

/// Read one line, failing if it exceeds `limit` bytes
async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
    if n > limit && buf.last() != Some(&b'\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("stdout line exceeds {} bytes", limit),
        ));
    }
    Ok(n)
}

fn decode_line(mut buf: Vec<u8>) -> RawLine {
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    match String::from_utf8(buf) {
        Ok(text) => RawLine::Text(text),
        Err(e) => RawLine::NonUtf8(String::from_utf8_lossy(e.as_bytes()).into_owned()),
    }
}

/// Ask the process to exit, give it `grace`, then kill it
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if !grace.is_zero() && request_exit(child) {
        if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
            return Some(status);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
    match timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    }
}

/// Send SIGTERM; false when there is nothing to wait for
#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

/// One scripted invocation for [`MockCliRunner`]
#[derive(Debug, Clone, Default)]
pub struct MockRun {
    pub lines: Vec<String>,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub spawn_error: Option<String>,
    /// Delay before any output; the abort future cuts it short
    pub delay: Option<Duration>,
    /// Produce nothing until aborted
    pub hang: bool,
}

impl MockRun {
    /// Successful run printing `lines`
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// Successful run printing each value as one JSON line
    pub fn events<I>(events: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        Self::lines(events.into_iter().map(|e| e.to_string()))
    }

    /// Run that blocks until aborted
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// Invocation that fails to start
    pub fn spawn_failure(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_exit(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Mock CLI runner for testing
///
/// Plays back scripted runs in order and records every invocation.
#[derive(Debug, Default)]
pub struct MockCliRunner {
    script: Mutex<VecDeque<MockRun>>,
    invocations: Mutex<Vec<CliInvocation>>,
}

impl MockCliRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(self, run: MockRun) -> Self {
        self.push(run);
        self
    }

    pub fn push(&self, run: MockRun) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(run);
    }

    /// Invocations seen so far
    pub fn invocations(&self) -> Vec<CliInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Scripted runs not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl CliRunner for MockCliRunner {
    async fn run(
        &self,
        invocation: &CliInvocation,
        sink: &mut dyn StreamSink,
        abort: AbortFuture<'_>,
    ) -> Result<CliExit> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());

        let run = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| {
                ConsiliumError::Spawn(format!("no scripted run for {}", invocation.program))
            })?;

        if let Some(error) = run.spawn_error {
            return Err(ConsiliumError::Spawn(error));
        }
        sink.on_spawn(Some(MOCK_PID));

        let aborted = if run.hang {
            abort.await;
            true
        } else if let Some(delay) = run.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = abort => true,
            }
        } else {
            false
        };

        if aborted {
            return Ok(CliExit {
                code: None,
                stderr: String::new(),
                end: StreamEnd::Aborted,
            });
        }

        let mut end = StreamEnd::Eof;
        for line in run.lines {
            if sink.on_line(RawLine::Text(line)).is_break() {
                end = StreamEnd::Stopped;
                break;
            }
        }

        Ok(CliExit {
            code: run.exit_code,
            stderr: run.stderr,
            end,
        })
    }
}
