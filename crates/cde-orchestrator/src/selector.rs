//! Agent selector - ranks eligible agents for a phase.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use cde_core::{AgentDescriptor, PhaseSpec};

use crate::registry::AgentRegistry;

/// Pure ranking policy.
///
/// Drops Unavailable agents and agents missing a required capability, then
/// orders by preferred-capability matches (descending), Healthy before
/// Degraded, and cost (ascending). The sort is stable, so remaining ties keep
/// the input (declaration) order.
pub fn rank_agents(
    agents: Vec<AgentDescriptor>,
    required: &BTreeSet<String>,
    preferred: &BTreeSet<String>,
) -> Vec<AgentDescriptor> {
    let mut eligible: Vec<AgentDescriptor> = agents
        .into_iter()
        .filter(|a| a.health.is_selectable() && a.satisfies(required))
        .collect();
    eligible.sort_by_key(|a| (Reverse(a.matched(preferred)), a.health, a.cost));
    eligible
}

/// Selects candidate agents from the registry.
#[derive(Clone)]
pub struct AgentSelector {
    registry: Arc<AgentRegistry>,
}

impl AgentSelector {
    /// Create a new AgentSelector.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Ranked candidates for the given capabilities. An empty list means no
    /// agent is eligible.
    pub async fn select_agents(
        &self,
        required: &BTreeSet<String>,
        preferred: &BTreeSet<String>,
    ) -> Vec<AgentDescriptor> {
        let agents = self.registry.list_agents().await;
        let total = agents.len();
        let ranked = rank_agents(agents, required, preferred);
        debug!(
            required = ?required,
            registered = total,
            eligible = ranked.len(),
            "Selected agents"
        );
        ranked
    }

    /// Ranked candidates for a phase.
    pub async fn select_for_phase(&self, phase: &PhaseSpec) -> Vec<AgentDescriptor> {
        self.select_agents(&phase.required_capabilities, &phase.preferred_capabilities)
            .await
    }
}
