//! Operator-facing status notices

use std::fmt;

/// A status notice surfaced to the operator
///
/// Notices never enter the journal; the collaborator decides how to show them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Processing { display_name: String },
    StayedSilent { display_name: String },
    EmptyResponse { display_name: String },
    ProcessingError { display_name: String, error: String },
    ContextOverflow { display_name: String },
    SessionReset { display_name: String },
    CompactFailed { display_name: String },
    CompactSucceeded { display_name: String },
    CommandNotConfigured { display_name: String },
    Participation { display_name: String, enabled: bool },
    MemberAdded { display_name: String },
    MemberRemoved { display_name: String },
    WaitingForApproval { display_name: String },
    StepModeChanged { enabled: bool },
    StepAutoContinue,
    NoPendingSteps,
    Interrupted,
}

impl Notice {
    /// Whether the notice reports a failure
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::ProcessingError { .. }
                | Self::SessionReset { .. }
                | Self::CompactFailed { .. }
                | Self::CommandNotConfigured { .. }
        )
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing { display_name } => {
                write!(f, "{}: processing the request...", display_name)
            }
            Self::StayedSilent { display_name } => write!(f, "{} stayed silent", display_name),
            Self::EmptyResponse { display_name } => {
                write!(f, "{} returned an empty response", display_name)
            }
            Self::ProcessingError { display_name, error } => {
                write!(f, "{}: error processing message ({})", display_name, error)
            }
            Self::ContextOverflow { display_name } => {
                write!(f, "{} context overflow, compacting...", display_name)
            }
            Self::SessionReset { display_name } => {
                write!(f, "{} session reset due to error, retry message", display_name)
            }
            Self::CompactFailed { display_name } => {
                write!(f, "{} failed to compact context, session reset", display_name)
            }
            Self::CompactSucceeded { display_name } => {
                write!(f, "{} context compacted, retrying message", display_name)
            }
            Self::CommandNotConfigured { display_name } => {
                write!(f, "CLI command path is not configured for {}", display_name)
            }
            Self::Participation {
                display_name,
                enabled,
            } => {
                let status = if *enabled { "enabled" } else { "disabled" };
                write!(f, "{} {} for chat participation", display_name, status)
            }
            Self::MemberAdded { display_name } => write!(f, "Added member: {}", display_name),
            Self::MemberRemoved { display_name } => write!(f, "Removed member: {}", display_name),
            Self::WaitingForApproval { display_name } => {
                write!(f, "{} is waiting for approval (continue to proceed)", display_name)
            }
            Self::StepModeChanged { enabled: true } => write!(f, "Step-by-step mode ENABLED"),
            Self::StepModeChanged { enabled: false } => write!(f, "Step-by-step mode DISABLED"),
            Self::StepAutoContinue => {
                write!(f, "Step-by-step mode disabled, continuing automatically...")
            }
            Self::NoPendingSteps => write!(f, "No pending steps"),
            Self::Interrupted => write!(f, "Interrupted by user"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_display() {
        let notice = Notice::ContextOverflow {
            display_name: "Codex".to_string(),
        };
        assert_eq!(notice.to_string(), "Codex context overflow, compacting...");
        assert!(!notice.is_warning());

        let notice = Notice::ProcessingError {
            display_name: "Gemini".to_string(),
            error: "exit code 1".to_string(),
        };
        assert_eq!(notice.to_string(), "Gemini: error processing message (exit code 1)");
        assert!(notice.is_warning());
    }

    #[test]
    fn test_participation_notice() {
        let notice = Notice::Participation {
            display_name: "Claude".to_string(),
            enabled: false,
        };
        assert_eq!(notice.to_string(), "Claude disabled for chat participation");
    }
}
