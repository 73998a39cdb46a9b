//! Persistence for Consilium
//!
//! Agent sessions and chat history live under `~/.consilium/workspaces/<hash>/`,
//! keyed by a hash of the workspace path. The agent registry resolves member
//! descriptors and user overrides from a JSON settings file and broadcasts
//! changes to subscribers. Prompt roles are stored once per user under
//! `~/.consilium/roles/`.

pub mod registry;
pub mod roles;
pub mod session;

pub use registry::{AgentDescriptor, AgentOverrides, AgentProfile, AgentRegistry, RegistryEvent};
pub use roles::{Role, RoleCatalog};
pub use session::{
    AgentSession, FileSessionStore, HistoryRecord, HistoryRole, MemorySessionStore, SessionStore,
};
