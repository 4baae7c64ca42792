//! Execution supervisor - dispatches one phase across ranked candidates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cde_core::{
    AgentDescriptor, AgentId, AttemptOutcome, AttemptRecord, DispatchPayload, DispatchResult,
    PhaseSpec, RunId, TaskDispatch,
};

use crate::error::AgentError;
use crate::registry::{AgentRegistry, HealthOutcome};

/// What a phase execution needs to know about its run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub task: String,
    pub root: PathBuf,
    /// Fires when the run is cancelled.
    pub cancel: CancellationToken,
}

/// Result of executing one phase.
#[derive(Debug)]
pub enum PhaseOutcome {
    /// An agent reported success. The validation gate has not run yet.
    Succeeded {
        agent_id: AgentId,
        result: DispatchResult,
        attempts: Vec<AttemptRecord>,
    },
    /// Candidates or retry budget exhausted.
    Failed {
        last_error: String,
        attempts: Vec<AttemptRecord>,
    },
    /// The run was cancelled mid-phase.
    Cancelled { attempts: Vec<AttemptRecord> },
}

impl PhaseOutcome {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Cancelled { attempts } => attempts,
        }
    }
}

enum Attempt {
    Succeeded(DispatchResult),
    Failed(AgentError),
    TimedOut,
    Cancelled,
    /// Every slot stayed taken until the deadline.
    Busy,
}

/// Dispatches phases and feeds every outcome back into agent health.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    registry: Arc<AgentRegistry>,
    default_timeout: Duration,
}

impl ExecutionSupervisor {
    /// Create a new supervisor. `default_timeout` applies to phases without
    /// their own timeout.
    pub fn new(registry: Arc<AgentRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// Try candidates in order until one succeeds, the retry budget is used up,
    /// or the run is cancelled.
    ///
    /// Each candidate gets at most one attempt, and attempts never exceed
    /// `phase.max_retries + 1`.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        phase: &PhaseSpec,
        candidates: &[AgentDescriptor],
    ) -> PhaseOutcome {
        let timeout = phase.timeout().unwrap_or(self.default_timeout);
        let budget = phase.max_attempts();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error = String::from("no candidates");

        for (idx, agent) in candidates.iter().take(budget).enumerate() {
            if ctx.cancel.is_cancelled() {
                return PhaseOutcome::Cancelled { attempts };
            }

            let attempt_no = idx as u32 + 1;
            let payload = DispatchPayload {
                task: ctx.task.clone(),
                instructions: phase.instructions.clone(),
                root_path: ctx.root.display().to_string(),
            };
            let dispatch = TaskDispatch::new(
                ctx.run_id.clone(),
                phase.name.clone(),
                agent.id.clone(),
                payload,
                timeout,
                attempt_no,
            );
            let dispatch_id = dispatch.id.clone();

            info!(
                run_id = %ctx.run_id,
                phase = %phase.name,
                agent_id = %agent.id,
                dispatch_id = %dispatch_id,
                attempt = attempt_no,
                budget,
                "Dispatching phase"
            );

            let started_at = Utc::now();
            let started = Instant::now();
            let attempt = self.dispatch(ctx, agent, dispatch, timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (outcome, error) = match &attempt {
                Attempt::Succeeded(_) => (AttemptOutcome::Succeeded, None),
                Attempt::Failed(e) => (AttemptOutcome::Failed, Some(e.to_string())),
                Attempt::TimedOut => (
                    AttemptOutcome::TimedOut,
                    Some(format!("timed out after {}ms", timeout.as_millis())),
                ),
                Attempt::Cancelled => (AttemptOutcome::Cancelled, Some("cancelled".to_string())),
                Attempt::Busy => (
                    AttemptOutcome::Busy,
                    Some(format!(
                        "agent busy: no free slot within {}ms",
                        timeout.as_millis()
                    )),
                ),
            };
            attempts.push(AttemptRecord {
                attempt: attempt_no,
                agent_id: agent.id.clone(),
                dispatch_id,
                outcome,
                error: error.clone(),
                duration_ms,
                started_at,
            });

            match attempt {
                Attempt::Succeeded(result) => {
                    self.registry
                        .update_health(&agent.id, HealthOutcome::Success)
                        .await;
                    info!(
                        run_id = %ctx.run_id,
                        phase = %phase.name,
                        agent_id = %agent.id,
                        duration_ms,
                        "Phase dispatch succeeded"
                    );
                    return PhaseOutcome::Succeeded {
                        agent_id: agent.id.clone(),
                        result,
                        attempts,
                    };
                }
                Attempt::Cancelled => {
                    info!(run_id = %ctx.run_id, phase = %phase.name, "Phase cancelled");
                    return PhaseOutcome::Cancelled { attempts };
                }
                Attempt::TimedOut => {
                    self.registry
                        .update_health(&agent.id, HealthOutcome::Timeout)
                        .await;
                    warn!(
                        run_id = %ctx.run_id,
                        phase = %phase.name,
                        agent_id = %agent.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Dispatch timed out"
                    );
                }
                Attempt::Busy => {
                    info!(
                        run_id = %ctx.run_id,
                        phase = %phase.name,
                        agent_id = %agent.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Agent busy, trying next candidate"
                    );
                }
                Attempt::Failed(_) => {
                    self.registry
                        .update_health(&agent.id, HealthOutcome::Failure)
                        .await;
                    warn!(
                        run_id = %ctx.run_id,
                        phase = %phase.name,
                        agent_id = %agent.id,
                        error = error.as_deref().unwrap_or(""),
                        "Dispatch failed"
                    );
                }
            }
            if let Some(error) = error {
                last_error = format!("{}: {}", agent.id, error);
            }
        }

        PhaseOutcome::Failed {
            last_error,
            attempts,
        }
    }

    /// One bounded attempt. Waiting for a concurrency slot and the agent's
    /// own work each get `timeout`; only the latter reaches the agent.
    async fn dispatch(
        &self,
        ctx: &RunContext,
        agent: &AgentDescriptor,
        mut dispatch: TaskDispatch,
        timeout: Duration,
    ) -> Attempt {
        let Some(client) = self.registry.client(&agent.id) else {
            return Attempt::Failed(AgentError::Unavailable(format!(
                "agent {} is not registered",
                agent.id
            )));
        };

        let _permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Attempt::Cancelled,
            res = tokio::time::timeout(timeout, self.registry.acquire(&agent.id)) => match res {
                Ok(Ok(permit)) => permit,
                Ok(Err(e)) => return Attempt::Failed(e),
                Err(_) => return Attempt::Busy,
            },
        };

        dispatch.rearm(timeout);
        let dispatch_id = dispatch.id.clone();
        let attempt = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Attempt::Cancelled,
            res = tokio::time::timeout(timeout, client.submit(dispatch)) => match res {
                Ok(Ok(result)) => Attempt::Succeeded(result),
                Ok(Err(AgentError::DeadlineExceeded)) | Err(_) => Attempt::TimedOut,
                Ok(Err(e)) => Attempt::Failed(e),
            },
        };

        if matches!(attempt, Attempt::TimedOut | Attempt::Cancelled) {
            client.cancel(&dispatch_id).await;
        }
        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AgentClient;
    use crate::registry::HealthPolicy;
    use async_trait::async_trait;
    use cde_core::{AgentHealth, DispatchId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every dispatch with the given message.
    struct Failing(&'static str);

    #[async_trait]
    impl AgentClient for Failing {
        async fn submit(&self, _dispatch: TaskDispatch) -> Result<DispatchResult, AgentError> {
            Err(AgentError::Rejected(self.0.to_string()))
        }

        async fn cancel(&self, _dispatch_id: &DispatchId) {}
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl AgentClient for Hanging {
        async fn submit(&self, _dispatch: TaskDispatch) -> Result<DispatchResult, AgentError> {
            std::future::pending().await
        }

        async fn cancel(&self, _dispatch_id: &DispatchId) {}
    }

    /// Succeeds after a fixed delay, counting submits and cancels.
    #[derive(Default)]
    struct Slow {
        delay: Duration,
        submits: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl Slow {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl AgentClient for Slow {
        async fn submit(&self, dispatch: TaskDispatch) -> Result<DispatchResult, AgentError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(DispatchResult::new(format!("{} done", dispatch.phase)))
        }

        async fn cancel(&self, _dispatch_id: &DispatchId) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn single_slot(client: Arc<Slow>) -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new(HealthPolicy::default());
        registry
            .register(
                AgentDescriptor::new("solo").with_max_concurrency(1),
                client as Arc<dyn AgentClient>,
            )
            .unwrap();
        Arc::new(registry)
    }

    fn ctx() -> RunContext {
        RunContext {
            run_id: RunId::new("run-1"),
            task: "fix the build".to_string(),
            root: PathBuf::from("/tmp"),
            cancel: CancellationToken::new(),
        }
    }

    fn registry_of(agents: Vec<(&str, Arc<dyn AgentClient>)>) -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new(HealthPolicy::default());
        for (id, client) in agents {
            registry.register(AgentDescriptor::new(id), client).unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_budget() {
        let registry = registry_of(vec![
            ("a", Arc::new(Failing("a broke"))),
            ("b", Arc::new(Failing("b broke"))),
            ("c", Arc::new(Failing("c broke"))),
        ]);
        let supervisor = ExecutionSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let phase = PhaseSpec::new("build").with_max_retries(1);
        let candidates = registry.list_agents().await;

        let outcome = supervisor.execute(&ctx(), &phase, &candidates).await;
        match outcome {
            PhaseOutcome::Failed {
                last_error,
                attempts,
            } => {
                assert_eq!(attempts.len(), 2);
                assert!(last_error.contains("b broke"));
                assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Failed));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(registry.health(&AgentId::new("c")).await, Some(AgentHealth::Healthy));
        assert_eq!(registry.health(&AgentId::new("a")).await, Some(AgentHealth::Degraded));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_dispatch() {
        let registry = registry_of(vec![("hang", Arc::new(Hanging))]);
        let supervisor = ExecutionSupervisor::new(Arc::clone(&registry), Duration::from_secs(60));
        let phase = PhaseSpec::new("build");
        let candidates = registry.list_agents().await;

        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = supervisor.execute(&ctx, &phase, &candidates).await;
        assert!(matches!(outcome, PhaseOutcome::Cancelled { ref attempts } if attempts.len() == 1));
        assert_eq!(outcome.attempts()[0].outcome, AttemptOutcome::Cancelled);
        // Cancellation is not the agent's fault.
        assert_eq!(
            registry.health(&AgentId::new("hang")).await,
            Some(AgentHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_empty_candidates_fail() {
        let registry = registry_of(Vec::new());
        let supervisor = ExecutionSupervisor::new(registry, Duration::from_secs(1));
        let outcome = supervisor
            .execute(&ctx(), &PhaseSpec::new("build"), &[])
            .await;
        assert!(matches!(outcome, PhaseOutcome::Failed { ref attempts, .. } if attempts.is_empty()));
    }

    #[tokio::test]
    async fn test_waiting_for_slot_does_not_eat_agent_deadline() {
        let client = Slow::new(Duration::from_millis(150));
        let registry = single_slot(Arc::clone(&client));
        let supervisor = ExecutionSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let phase = PhaseSpec::new("build")
            .with_timeout(Duration::from_millis(200))
            .with_max_retries(0);
        let candidates = registry.list_agents().await;

        let (first_ctx, second_ctx) = (ctx(), ctx());
        let (first, second) = tokio::join!(
            supervisor.execute(&first_ctx, &phase, &candidates),
            supervisor.execute(&second_ctx, &phase, &candidates),
        );

        assert!(matches!(first, PhaseOutcome::Succeeded { .. }), "{first:?}");
        assert!(matches!(second, PhaseOutcome::Succeeded { .. }), "{second:?}");
        assert_eq!(client.submits.load(Ordering::SeqCst), 2);
        assert_eq!(client.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(
            registry.health(&AgentId::new("solo")).await,
            Some(AgentHealth::Healthy)
        );
    }

    #[tokio::test]
    async fn test_busy_agent_recorded_without_health_penalty() {
        let client = Slow::new(Duration::from_millis(1));
        let registry = single_slot(Arc::clone(&client));
        let supervisor = ExecutionSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let phase = PhaseSpec::new("build")
            .with_timeout(Duration::from_millis(50))
            .with_max_retries(0);
        let candidates = registry.list_agents().await;

        let held = registry.acquire(&AgentId::new("solo")).await.unwrap();
        let outcome = supervisor.execute(&ctx(), &phase, &candidates).await;
        drop(held);

        match outcome {
            PhaseOutcome::Failed {
                last_error,
                attempts,
            } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].outcome, AttemptOutcome::Busy);
                assert!(last_error.contains("busy"), "{last_error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(client.submits.load(Ordering::SeqCst), 0);
        assert_eq!(client.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(
            registry.health(&AgentId::new("solo")).await,
            Some(AgentHealth::Healthy)
        );
        let stats = registry.stats().await;
        assert_eq!(stats[0].timeouts, 0);
    }
}
