//! # consilium-core
//!
//! Core types for the Consilium group chat between a human operator and
//! several AI command-line agents.
//!
//! ## Core Paradigm
//!
//! - Every message IS a journal entry (ids are strictly increasing)
//! - Visibility IS derived from entry metadata, never stored twice
//! - Participants ARE stable agent ids; display names are a renameable view
//! - The operator sees everything, including both sides of secret exchanges

mod config;
mod error;
pub mod fail_open;
mod notice;
pub mod prompts;
mod signal;
mod types;

pub use config::{ConsiliumConfig, PromptConfig, RuntimeConfig};
pub use error::{ConsiliumError, Result};
pub use notice::Notice;
pub use signal::RunSignals;
pub use types::*;
