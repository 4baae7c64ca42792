//! Status enums for workflow runs, phases and agents.

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Status of a WorkflowRun.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run accepted but not yet started.
    #[default]
    Pending,
    /// Run is progressing through its phases.
    Running,
    /// An agent reported success but the validation gate rejected the project state.
    Blocked,
    /// Every phase succeeded and passed its gate.
    Succeeded,
    /// The run ended without success.
    Failed,
}

impl RunStatus {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Succeeded | Self::Failed)
    }

    /// Process exit code surfaced to callers for a terminal status.
    ///
    /// Non-terminal statuses map to the failure code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => exit_codes::SUCCEEDED,
            Self::Blocked => exit_codes::BLOCKED,
            Self::Pending | Self::Running | Self::Failed => exit_codes::FAILED,
        }
    }

    /// Lowercase name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Status of one phase within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// Phase is dispatching or validating.
    #[default]
    Running,
    /// Phase executed and passed its validation gate.
    Succeeded,
    /// Phase could not be executed successfully.
    Failed,
    /// Phase executed but its validation gate failed.
    Blocked,
    /// Phase was interrupted by run cancellation.
    Cancelled,
}

impl PhaseStatus {
    /// Returns true once the phase has a final outcome.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Health of an execution backend as observed by the supervisor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentHealth {
    /// Agent is working normally.
    #[default]
    Healthy,
    /// Agent recently failed or timed out; still eligible as a fallback.
    Degraded,
    /// Agent failed repeatedly and is excluded from selection.
    Unavailable,
}

impl AgentHealth {
    /// Returns true if the agent may be selected for a dispatch.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Lowercase name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Blocked.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_exit_codes_per_status() {
        assert_eq!(RunStatus::Succeeded.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Blocked.exit_code(), 2);
    }

    #[test]
    fn test_health_ordering_prefers_healthy() {
        assert!(AgentHealth::Healthy < AgentHealth::Degraded);
        assert!(AgentHealth::Degraded < AgentHealth::Unavailable);
        assert!(!AgentHealth::Unavailable.is_selectable());
    }
}
