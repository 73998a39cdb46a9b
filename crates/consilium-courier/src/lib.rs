//! # consilium-courier
//!
//! Message routing for the Consilium group chat.
//!
//! ## Delivery model
//!
//! - The journal is the only history; participants hold cursors into it
//! - A participant's turn carries every visible entry past its cursor
//! - The pending queue holds each participant at most once; mentions and
//!   private messages move participants to its front
//! - Step mode pauses before each non-introduction delivery until the
//!   operator continues
//!
//! [`Conversation`] wires the courier to the agent registry, the session
//! store and a host [`CourierCollaborator`].

pub mod collaborator;
pub mod context;
pub mod conversation;
pub mod courier;
pub mod header;
pub mod journal;
pub mod mentions;
pub mod pending;
pub mod roster;
pub mod step_gate;
pub mod tasks;

pub use collaborator::CourierCollaborator;
pub use context::ContextBuilder;
pub use conversation::{Conversation, ConversationParts, INTRODUCTION_TEXT};
pub use courier::{Courier, CourierOptions};
pub use header::{extract_header, ReplyHeader};
pub use journal::Journal;
pub use mentions::{MentionDirectory, Mentions};
pub use pending::PendingQueue;
pub use roster::{Roster, RosterMember};
pub use step_gate::{GateDecision, StepContinue, StepGate, StepToggle};
pub use tasks::BackgroundTasks;
