//! Agent registry - declared agents, their clients and observed health.
//!
//! Health is the only state shared between runs. Each agent carries its own
//! lock, so outcomes for different agents never contend.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{info, warn};

use cde_core::{AgentDescriptor, AgentHealth, AgentId};

use crate::client::AgentClient;
use crate::error::{AgentError, ConfigError};

/// Thresholds for health transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Consecutive successes that promote a Degraded agent to Healthy.
    pub promote_after_successes: u32,

    /// Consecutive failures or timeouts that make an agent Unavailable.
    pub unavailable_after_failures: u32,

    /// Time after the last failure at which an Unavailable agent is offered
    /// again as Degraded (seconds).
    pub unavailable_cooldown_secs: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            promote_after_successes: 2,
            unavailable_after_failures: 3,
            unavailable_cooldown_secs: 300,
        }
    }
}

impl HealthPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.unavailable_cooldown_secs)
    }
}

/// Outcome of one dispatch attempt, as far as agent health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Success,
    Timeout,
    Failure,
}

/// A health state change caused by one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: AgentHealth,
    pub to: AgentHealth,
}

/// Mutable health bookkeeping for one agent.
#[derive(Debug, Clone, Default)]
struct HealthRecord {
    state: AgentHealth,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    successes: u64,
    failures: u64,
    timeouts: u64,
}

impl HealthRecord {
    /// Health as seen by selection: Unavailable becomes Degraded once the
    /// cooldown since the last failure has elapsed.
    fn effective(&self, policy: &HealthPolicy, now: Instant) -> AgentHealth {
        match (self.state, self.last_failure_at) {
            (AgentHealth::Unavailable, Some(at))
                if now.duration_since(at) >= policy.cooldown() =>
            {
                AgentHealth::Degraded
            }
            (state, _) => state,
        }
    }

    /// Apply one outcome. At most one state change per outcome.
    fn apply(
        &mut self,
        outcome: HealthOutcome,
        policy: &HealthPolicy,
        now: Instant,
    ) -> AgentHealth {
        let current = self.effective(policy, now);
        match outcome {
            HealthOutcome::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.state = match current {
                    AgentHealth::Degraded
                        if self.consecutive_successes >= policy.promote_after_successes =>
                    {
                        AgentHealth::Healthy
                    }
                    AgentHealth::Unavailable => AgentHealth::Degraded,
                    other => other,
                };
            }
            HealthOutcome::Timeout | HealthOutcome::Failure => {
                if outcome == HealthOutcome::Timeout {
                    self.timeouts += 1;
                } else {
                    self.failures += 1;
                }
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.last_failure_at = Some(now);
                self.state = if self.consecutive_failures >= policy.unavailable_after_failures {
                    AgentHealth::Unavailable
                } else {
                    AgentHealth::Degraded
                };
            }
        }
        self.state
    }
}

/// Per-agent counters exported as metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStats {
    pub descriptor: AgentDescriptor,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Dispatches currently holding a concurrency permit.
    pub in_flight: usize,
}

struct RegisteredAgent {
    descriptor: AgentDescriptor,
    client: Arc<dyn AgentClient>,
    health: Mutex<HealthRecord>,
    permits: Arc<Semaphore>,
}

/// Registry of execution backends, in declaration order.
///
/// Agents are registered at startup; afterwards the registry is shared by
/// `Arc` and only health changes.
pub struct AgentRegistry {
    agents: Vec<RegisteredAgent>,
    policy: HealthPolicy,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            agents: Vec::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Register an agent. Declaration order is the final selection tie-break.
    pub fn register(
        &mut self,
        descriptor: AgentDescriptor,
        client: Arc<dyn AgentClient>,
    ) -> Result<(), ConfigError> {
        if descriptor.id.as_str().trim().is_empty() {
            return Err(ConfigError::InvalidAgent {
                id: descriptor.id.to_string(),
                message: "agent id is empty".to_string(),
            });
        }
        if self.find(&descriptor.id).is_some() {
            return Err(ConfigError::DuplicateAgent(descriptor.id.to_string()));
        }

        let permits = Arc::new(Semaphore::new(descriptor.max_concurrency.max(1) as usize));
        let health = HealthRecord {
            state: descriptor.health,
            ..HealthRecord::default()
        };
        info!(
            agent_id = %descriptor.id,
            capabilities = ?descriptor.capabilities,
            cost = descriptor.cost,
            "Agent registered"
        );
        self.agents.push(RegisteredAgent {
            descriptor,
            client,
            health: Mutex::new(health),
            permits,
        });
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_agent(
        mut self,
        descriptor: AgentDescriptor,
        client: Arc<dyn AgentClient>,
    ) -> Result<Self, ConfigError> {
        self.register(descriptor, client)?;
        Ok(self)
    }

    fn find(&self, agent_id: &AgentId) -> Option<&RegisteredAgent> {
        self.agents.iter().find(|a| &a.descriptor.id == agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Snapshot of every agent with its effective health, in declaration order.
    pub async fn list_agents(&self) -> Vec<AgentDescriptor> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let health = agent.health.lock().await.effective(&self.policy, now);
            let mut descriptor = agent.descriptor.clone();
            descriptor.health = health;
            out.push(descriptor);
        }
        out
    }

    /// Effective health of one agent.
    pub async fn health(&self, agent_id: &AgentId) -> Option<AgentHealth> {
        let agent = self.find(agent_id)?;
        let record = agent.health.lock().await;
        Some(record.effective(&self.policy, Instant::now()))
    }

    /// Record a dispatch outcome and return the resulting state change, if any.
    pub async fn update_health(
        &self,
        agent_id: &AgentId,
        outcome: HealthOutcome,
    ) -> Option<HealthTransition> {
        let Some(agent) = self.find(agent_id) else {
            warn!(agent_id = %agent_id, "Health update for unknown agent");
            return None;
        };

        let now = Instant::now();
        let mut record = agent.health.lock().await;
        let from = record.effective(&self.policy, now);
        let to = record.apply(outcome, &self.policy, now);
        drop(record);

        if from == to {
            return None;
        }
        match to {
            AgentHealth::Unavailable => warn!(
                agent_id = %agent_id,
                from = from.as_str(),
                to = to.as_str(),
                "Agent health changed"
            ),
            _ => info!(
                agent_id = %agent_id,
                from = from.as_str(),
                to = to.as_str(),
                "Agent health changed"
            ),
        }
        Some(HealthTransition { from, to })
    }

    /// Client for an agent.
    pub fn client(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentClient>> {
        self.find(agent_id).map(|a| Arc::clone(&a.client))
    }

    /// Wait for a concurrency permit. Dropping the permit frees the slot.
    pub async fn acquire(&self, agent_id: &AgentId) -> Result<OwnedSemaphorePermit, AgentError> {
        let agent = self
            .find(agent_id)
            .ok_or_else(|| AgentError::Unavailable(format!("unknown agent {agent_id}")))?;
        Arc::clone(&agent.permits)
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Unavailable(format!("agent {agent_id} is shut down")))
    }

    /// Counters for every agent, in declaration order.
    pub async fn stats(&self) -> Vec<AgentStats> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let record = agent.health.lock().await;
            let mut descriptor = agent.descriptor.clone();
            descriptor.health = record.effective(&self.policy, now);
            let limit = agent.descriptor.max_concurrency.max(1) as usize;
            out.push(AgentStats {
                descriptor,
                successes: record.successes,
                failures: record.failures,
                timeouts: record.timeouts,
                in_flight: limit.saturating_sub(agent.permits.available_permits()),
            });
        }
        out
    }
}
