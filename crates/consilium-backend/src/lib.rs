//! # consilium-backend
//!
//! Drives external agent CLIs (Codex, Claude, Gemini) for one conversation
//! turn at a time.
//!
//! ## Turn protocol
//!
//! 1. Decide whether to prepend the identity/protocol/participants preamble
//! 2. Resolve the command (override path, else default executable)
//! 3. Resume the stored session, or start fresh
//! 4. Stream stdout as JSON lines through the backend's event parser
//! 5. Classify the exit: reply, error reply, silence, overflow
//! 6. On overflow compact once and retry once
//! 7. Persist the session id and message counter

mod adapter;
pub mod classify;
mod dispatch;
mod event;
mod kind;
mod observer;
pub mod process;
pub mod prompt;
mod runtime;

pub use adapter::CliTurn;
pub use dispatch::{DispatchController, DispatchSettings, TurnOutcome, TurnRequest};
pub use event::StreamEvent;
pub use kind::BackendKind;
pub use observer::{NullObserver, TurnObserver};
pub use process::{CliExit, CliInvocation, CliRunner, MockCliRunner, MockRun, StreamEnd, TokioCliRunner};
pub use prompt::SystemPromptPolicy;
pub use runtime::{AgentRuntime, AgentRuntimeTable, RuntimeHandle};
