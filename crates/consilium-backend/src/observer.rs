//! Turn observer: where a dispatch reports progress

use consilium_core::{Notice, ParticipantId};

/// Receives notices and tool-call events while a turn runs
///
/// Callbacks are synchronous and must not block; implementations typically
/// forward to a channel or a UI.
pub trait TurnObserver: Send + Sync {
    fn notice(&self, notice: Notice);

    /// An agent invoked a tool (shell command, file edit, ...)
    fn tool_call(&self, agent: &ParticipantId, tool: &str, detail: &str) {
        let _ = (agent, tool, detail);
    }
}

/// Observer that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TurnObserver for NullObserver {
    fn notice(&self, _notice: Notice) {}
}
