//! Workflow state machine - drives a run through its recipe's phases.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use cde_core::{AgentId, CoreError, PhaseSpec, Recipe, RunError, WorkflowRun};

use crate::error::ScanError;
use crate::scanner::Scanner;
use crate::selector::AgentSelector;
use crate::supervisor::{ExecutionSupervisor, PhaseOutcome, RunContext};

/// Sequences phases: select candidates, execute, gate on a fresh scan.
///
/// The machine is the only writer of a run. Every change is published as a
/// snapshot on the run's watch channel.
#[derive(Clone)]
pub struct WorkflowMachine {
    selector: AgentSelector,
    supervisor: ExecutionSupervisor,
    scanner: Arc<Scanner>,
}

/// Where a run stands after one phase.
enum Step {
    Continue,
    Stop,
}

impl WorkflowMachine {
    pub fn new(
        selector: AgentSelector,
        supervisor: ExecutionSupervisor,
        scanner: Arc<Scanner>,
    ) -> Self {
        Self {
            selector,
            supervisor,
            scanner,
        }
    }

    /// Drive a running run with an assigned recipe to a terminal status.
    pub async fn drive(
        &self,
        mut run: WorkflowRun,
        recipe: &Recipe,
        ctx: &RunContext,
        publish: &watch::Sender<WorkflowRun>,
    ) -> WorkflowRun {
        if let Err(e) = self.advance(&mut run, recipe, ctx, publish).await {
            error!(run_id = %run.id, error = %e, "Run state machine rejected a transition");
            if !run.is_terminal() {
                // Failing a Running run is always a legal transition.
                let _ = run.fail(RunError::Internal {
                    message: e.to_string(),
                });
            }
            publish.send_replace(run.clone());
        }

        info!(
            run_id = %run.id,
            recipe = %recipe.name,
            status = run.status.as_str(),
            attempts = run.attempt_trace().count(),
            "Run finished"
        );
        run
    }

    async fn advance(
        &self,
        run: &mut WorkflowRun,
        recipe: &Recipe,
        ctx: &RunContext,
        publish: &watch::Sender<WorkflowRun>,
    ) -> Result<(), CoreError> {
        for phase in &recipe.phases {
            if ctx.cancel.is_cancelled() {
                run.fail(RunError::CancellationRequested)?;
                publish.send_replace(run.clone());
                return Ok(());
            }

            run.begin_phase(&phase.name)?;
            publish.send_replace(run.clone());
            info!(run_id = %run.id, phase = %phase.name, "Phase started");

            let step = self.run_phase(run, phase, ctx).await?;
            publish.send_replace(run.clone());
            if let Step::Stop = step {
                return Ok(());
            }
        }

        run.succeed()?;
        publish.send_replace(run.clone());
        Ok(())
    }

    async fn run_phase(
        &self,
        run: &mut WorkflowRun,
        phase: &PhaseSpec,
        ctx: &RunContext,
    ) -> Result<Step, CoreError> {
        let candidates = self.selector.select_for_phase(phase).await;
        if candidates.is_empty() {
            warn!(
                run_id = %run.id,
                phase = %phase.name,
                required = ?phase.required_capabilities,
                "No eligible agent"
            );
            run.fail(RunError::NoEligibleAgent {
                phase: phase.name.clone(),
            })?;
            return Ok(Step::Stop);
        }

        match self.supervisor.execute(ctx, phase, &candidates).await {
            PhaseOutcome::Succeeded {
                agent_id,
                result,
                attempts,
            } => {
                run.record_attempts(attempts)?;
                self.gate(run, phase, ctx, agent_id, result.summary).await
            }
            PhaseOutcome::Failed {
                last_error,
                attempts,
            } => {
                let count = attempts.len();
                run.record_attempts(attempts)?;
                run.fail(RunError::DispatchExhausted {
                    phase: phase.name.clone(),
                    attempts: count,
                    last_error,
                })?;
                Ok(Step::Stop)
            }
            PhaseOutcome::Cancelled { attempts } => {
                run.record_attempts(attempts)?;
                run.fail(RunError::CancellationRequested)?;
                Ok(Step::Stop)
            }
        }
    }

    /// Re-scan the project and evaluate the phase's post-condition.
    async fn gate(
        &self,
        run: &mut WorkflowRun,
        phase: &PhaseSpec,
        ctx: &RunContext,
        agent_id: AgentId,
        summary: String,
    ) -> Result<Step, CoreError> {
        let report = match self.scanner.scan(&ctx.root, &ctx.cancel).await {
            Ok(report) => report,
            Err(ScanError::Cancelled) => {
                run.fail(RunError::CancellationRequested)?;
                return Ok(Step::Stop);
            }
            Err(e) => {
                warn!(run_id = %run.id, phase = %phase.name, error = %e, "Validation scan failed");
                run.fail(RunError::ScanFailed {
                    message: e.to_string(),
                })?;
                return Ok(Step::Stop);
            }
        };

        if phase.validation.evaluate(&report) {
            info!(run_id = %run.id, phase = %phase.name, agent_id = %agent_id, "Phase passed");
            run.complete_phase(agent_id, Some(summary))?;
            Ok(Step::Continue)
        } else {
            warn!(
                run_id = %run.id,
                phase = %phase.name,
                predicate = %phase.validation,
                "Validation gate failed"
            );
            run.block_phase(agent_id, phase.validation.to_string())?;
            Ok(Step::Stop)
        }
    }
}
