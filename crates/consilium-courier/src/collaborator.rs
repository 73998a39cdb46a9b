//! The courier's typed contract with its host (UI, CLI, tests)

use async_trait::async_trait;

use consilium_backend::TurnObserver;
use consilium_core::JournalEntry;

/// What the courier needs from the outside world
///
/// Notices and tool-call events arrive through the [`TurnObserver`]
/// supertrait; journal entries through [`publish_entry`](Self::publish_entry).
#[async_trait]
pub trait CourierCollaborator: TurnObserver {
    /// A new, non-init journal entry is ready to show (and persist)
    async fn publish_entry(&self, entry: &JournalEntry);

    /// Prompt of the role assigned to an agent, if any
    fn role_prompt(&self, agent_id: &consilium_core::ParticipantId) -> Option<String> {
        let _ = agent_id;
        None
    }
}
