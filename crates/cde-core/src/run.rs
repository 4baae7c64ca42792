//! WorkflowRun and its phase history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AgentId, CoreError, DispatchId, PhaseStatus, Recipe, RunId, RunStatus};

/// How a single dispatch attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// The agent reported a failure.
    Failed,
    /// The deadline passed before the agent answered.
    TimedOut,
    /// The run was cancelled while the dispatch was in flight.
    Cancelled,
    /// No concurrency slot freed up before the deadline; the agent never saw
    /// the dispatch.
    Busy,
}

/// Diagnostic record of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt counter within the phase.
    pub attempt: u32,
    pub agent_id: AgentId,
    pub dispatch_id: DispatchId,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// Why a run ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    /// The initial or post-phase scan failed.
    #[error("project scan failed: {message}")]
    ScanFailed { message: String },

    /// No recipe could be selected for the task.
    #[error("no applicable recipe: {message}")]
    NoApplicableRecipe { message: String },

    /// No registered agent satisfies the phase's capabilities.
    #[error("no eligible agent for phase '{phase}'")]
    NoEligibleAgent { phase: String },

    /// Every candidate failed or timed out, or the retry budget ran out.
    #[error("phase '{phase}' failed after {attempts} attempt(s): {last_error}")]
    DispatchExhausted {
        phase: String,
        attempts: usize,
        last_error: String,
    },

    /// The agent succeeded but the project state failed the phase predicate.
    #[error("phase '{phase}' did not pass validation: {predicate}")]
    ValidationGateFailure { phase: String, predicate: String },

    /// The caller cancelled the run.
    #[error("cancellation requested")]
    CancellationRequested,

    /// The state machine rejected its own transition.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// History entry for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    pub status: PhaseStatus,
    /// Agent whose attempt produced the final outcome, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Every dispatch attempt made for this phase, in order.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Summary reported by the successful agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl PhaseRecord {
    fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            status: PhaseStatus::Running,
            agent_id: None,
            started_at: Utc::now(),
            finished_at: None,
            attempts: Vec::new(),
            summary: None,
        }
    }

    fn finish(&mut self, status: PhaseStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// A single workflow execution.
///
/// Only the workflow state machine mutates a run; everyone else reads clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub task_description: String,
    pub root_path: String,
    /// Name of the selected recipe, once chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    /// Ordered phase names of the selected recipe.
    #[serde(default)]
    pub phases: Vec<String>,
    /// Phase currently executing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub history: Vec<PhaseRecord>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Create a pending run.
    pub fn new(task_description: impl Into<String>, root_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            task_description: task_description.into(),
            root_path: root_path.into(),
            recipe: None,
            phases: Vec::new(),
            current_phase: None,
            history: Vec::new(),
            status: RunStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: RunStatus) -> Result<(), CoreError> {
        let allowed = match (self.status, to) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed) => true,
            (RunStatus::Running, s) => s.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
            self.current_phase = None;
        }
        Ok(())
    }

    /// Pending -> Running.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(RunStatus::Running)
    }

    /// Record the recipe selected for this run. Only allowed once.
    pub fn assign_recipe(&mut self, recipe: &Recipe) -> Result<(), CoreError> {
        if self.status != RunStatus::Running || self.recipe.is_some() {
            return Err(CoreError::InvalidInput(format!(
                "cannot assign recipe '{}' to run {} in state {}",
                recipe.name,
                self.id,
                self.status.as_str()
            )));
        }
        self.recipe = Some(recipe.name.clone());
        self.phases = recipe.phase_names();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Index of the next phase to run; phases are entered strictly in order.
    pub fn next_phase_index(&self) -> usize {
        self.history.len()
    }

    /// Enter the next phase. Fails if a phase is active, the name is not the
    /// next one in recipe order, or the run is not running.
    pub fn begin_phase(&mut self, phase: &str) -> Result<(), CoreError> {
        if self.status != RunStatus::Running {
            return Err(CoreError::PhaseOrder {
                phase: phase.to_string(),
                reason: format!("run is {}", self.status.as_str()),
            });
        }
        if let Some(active) = &self.current_phase {
            return Err(CoreError::PhaseOrder {
                phase: phase.to_string(),
                reason: format!("phase '{active}' is still active"),
            });
        }
        match self.phases.get(self.next_phase_index()) {
            Some(expected) if expected == phase => {}
            Some(expected) => {
                return Err(CoreError::PhaseOrder {
                    phase: phase.to_string(),
                    reason: format!("next phase is '{expected}'"),
                })
            }
            None => {
                return Err(CoreError::PhaseOrder {
                    phase: phase.to_string(),
                    reason: "no phases remain".to_string(),
                })
            }
        }

        self.history.push(PhaseRecord::new(phase));
        self.current_phase = Some(phase.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The history entry of the active phase.
    pub fn active_phase(&self) -> Option<&PhaseRecord> {
        self.current_phase.as_ref()?;
        self.history.last()
    }

    fn active_phase_mut(&mut self) -> Result<&mut PhaseRecord, CoreError> {
        let phase = self.current_phase.clone().ok_or_else(|| CoreError::PhaseOrder {
            phase: String::new(),
            reason: "no phase is active".to_string(),
        })?;
        self.history
            .last_mut()
            .filter(|record| record.phase == phase)
            .ok_or(CoreError::PhaseOrder {
                phase,
                reason: "active phase has no history entry".to_string(),
            })
    }

    /// Append attempt records to the active phase.
    pub fn record_attempts(&mut self, attempts: Vec<AttemptRecord>) -> Result<(), CoreError> {
        self.active_phase_mut()?.attempts.extend(attempts);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The active phase executed and passed its validation gate.
    pub fn complete_phase(
        &mut self,
        agent_id: AgentId,
        summary: Option<String>,
    ) -> Result<(), CoreError> {
        let record = self.active_phase_mut()?;
        record.agent_id = Some(agent_id);
        record.summary = summary;
        record.finish(PhaseStatus::Succeeded);
        self.current_phase = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The active phase executed but its validation gate failed. Ends the run as Blocked.
    pub fn block_phase(&mut self, agent_id: AgentId, predicate: String) -> Result<(), CoreError> {
        let record = self.active_phase_mut()?;
        record.agent_id = Some(agent_id);
        record.finish(PhaseStatus::Blocked);
        let phase = record.phase.clone();
        self.error = Some(RunError::ValidationGateFailure { phase, predicate });
        self.transition(RunStatus::Blocked)
    }

    /// End the run as Failed. Closes the active phase if there is one.
    pub fn fail(&mut self, error: RunError) -> Result<(), CoreError> {
        let phase_status = match error {
            RunError::CancellationRequested => PhaseStatus::Cancelled,
            _ => PhaseStatus::Failed,
        };
        if let Ok(record) = self.active_phase_mut() {
            record.finish(phase_status);
        }
        self.error = Some(error);
        self.transition(RunStatus::Failed)
    }

    /// End the run as Succeeded. Every recipe phase must have completed.
    pub fn succeed(&mut self) -> Result<(), CoreError> {
        let done = self.history.len() == self.phases.len()
            && self
                .history
                .iter()
                .all(|r| r.status == PhaseStatus::Succeeded);
        if !done || self.current_phase.is_some() {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: RunStatus::Succeeded.as_str().to_string(),
            });
        }
        self.transition(RunStatus::Succeeded)
    }

    /// Every attempt made across all phases, in order.
    pub fn attempt_trace(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.history.iter().flat_map(|r| r.attempts.iter())
    }

    /// Returns true if the phase was ever dispatched.
    pub fn ran_phase(&self, phase: &str) -> bool {
        self.history.iter().any(|r| r.phase == phase)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}
