//! The unit of work handed to an agent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, DispatchId, RunId};

/// What the agent is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPayload {
    /// The original task description submitted by the caller.
    pub task: String,

    /// Phase-specific instructions from the recipe.
    pub instructions: String,

    /// Project root the agent should work in.
    pub root_path: String,
}

impl DispatchPayload {
    /// Render the payload as a single prompt string.
    pub fn prompt(&self, phase: &str) -> String {
        if self.instructions.is_empty() {
            format!("[{phase}] {}", self.task)
        } else {
            format!("[{phase}] {}\n\n{}", self.task, self.instructions)
        }
    }
}

/// One attempt at running a phase on one agent.
///
/// A dispatch is created per attempt and discarded once its outcome is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDispatch {
    /// Unique dispatch identifier, used for cancellation.
    pub id: DispatchId,

    /// Run this dispatch belongs to.
    pub run_id: RunId,

    /// Phase being executed.
    pub phase: String,

    /// Agent the dispatch is addressed to.
    pub agent_id: AgentId,

    /// Work description.
    pub payload: DispatchPayload,

    /// Absolute deadline; agents must give up by this instant.
    pub deadline: DateTime<Utc>,

    /// 1-based attempt counter within the phase.
    pub attempt: u32,
}

impl TaskDispatch {
    /// Create a new dispatch whose deadline is `timeout` from now.
    pub fn new(
        run_id: RunId,
        phase: impl Into<String>,
        agent_id: AgentId,
        payload: DispatchPayload,
        timeout: Duration,
        attempt: u32,
    ) -> Self {
        Self {
            id: DispatchId::generate(),
            run_id,
            phase: phase.into(),
            agent_id,
            payload,
            deadline: deadline_after(timeout),
            attempt,
        }
    }

    /// Restart the deadline so the agent gets the full `timeout` from now.
    pub fn rearm(&mut self, timeout: Duration) {
        self.deadline = deadline_after(timeout);
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns true once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }
}

fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    let timeout =
        chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
    let now = Utc::now();
    now.checked_add_signed(timeout).unwrap_or(now)
}

/// What an agent reports back on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Short human-readable summary of what the agent did.
    pub summary: String,

    /// Files the agent reports having created or modified.
    #[serde(default)]
    pub files_modified: Vec<String>,
}

impl DispatchResult {
    /// Create a result with only a summary.
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            files_modified: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> DispatchPayload {
        DispatchPayload {
            task: "add login endpoint".to_string(),
            instructions: String::new(),
            root_path: "/tmp/project".to_string(),
        }
    }

    #[test]
    fn test_deadline_in_future() {
        let dispatch = TaskDispatch::new(
            RunId::generate(),
            "implement",
            AgentId::new("aider"),
            payload(),
            Duration::from_secs(60),
            1,
        );
        assert!(!dispatch.is_expired());
        assert!(dispatch.remaining() > Duration::from_secs(50));
    }

    #[test]
    fn test_rearm_restarts_deadline() {
        let mut dispatch = TaskDispatch::new(
            RunId::generate(),
            "implement",
            AgentId::new("aider"),
            payload(),
            Duration::ZERO,
            1,
        );
        assert!(dispatch.is_expired());
        dispatch.rearm(Duration::from_secs(60));
        assert!(!dispatch.is_expired());
    }

    #[test]
    fn test_zero_timeout_is_expired() {
        let dispatch = TaskDispatch::new(
            RunId::generate(),
            "implement",
            AgentId::new("aider"),
            payload(),
            Duration::ZERO,
            1,
        );
        assert!(dispatch.is_expired());
        assert_eq!(dispatch.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_prompt_includes_phase_and_instructions() {
        let mut p = payload();
        assert_eq!(p.prompt("plan"), "[plan] add login endpoint");
        p.instructions = "Write a plan.".to_string();
        assert!(p.prompt("plan").ends_with("Write a plan."));
    }
}
