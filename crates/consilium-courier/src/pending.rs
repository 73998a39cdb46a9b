//! Ordered, duplicate-free queue of participants awaiting a turn

use std::collections::{HashSet, VecDeque};

use consilium_core::ParticipantId;

#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    order: VecDeque<ParticipantId>,
    members: HashSet<ParticipantId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the back unless already queued
    pub fn enqueue(&mut self, participant: &ParticipantId) -> bool {
        if !self.members.insert(participant.clone()) {
            return false;
        }
        self.order.push_back(participant.clone());
        true
    }

    /// Move a queued participant to the front; no-op when not queued
    pub fn prioritize(&mut self, participant: &ParticipantId) -> bool {
        if !self.members.contains(participant) {
            return false;
        }
        let Some(index) = self.order.iter().position(|p| p == participant) else {
            return false;
        };
        if let Some(found) = self.order.remove(index) {
            self.order.push_front(found);
        }
        true
    }

    pub fn pop(&mut self) -> Option<ParticipantId> {
        let participant = self.order.pop_front()?;
        self.members.remove(&participant);
        Some(participant)
    }

    /// Drop every occurrence and the membership record
    pub fn purge(&mut self, participant: &ParticipantId) {
        self.members.remove(participant);
        self.order.retain(|p| p != participant);
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.members.contains(participant)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Current order, front first
    pub fn snapshot(&self) -> Vec<ParticipantId> {
        self.order.iter().cloned().collect()
    }
}
