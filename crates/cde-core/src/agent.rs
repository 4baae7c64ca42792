//! Agent descriptor types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{AgentHealth, AgentId};

/// Declared capabilities and observed health of one execution backend.
///
/// Descriptors handed out by the registry are snapshots; mutating one has no
/// effect on the registry's health records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent identifier.
    pub id: AgentId,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Capabilities this agent declares (e.g. "plan", "code", "test", "docs").
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Relative cost weight; lower is preferred.
    #[serde(default)]
    pub cost: u32,

    /// Maximum number of dispatches this agent accepts at once.
    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,

    /// Health as last observed by the execution supervisor.
    #[serde(default)]
    pub health: AgentHealth,
}

fn default_concurrency() -> u32 {
    1
}

impl AgentDescriptor {
    /// Create a new AgentDescriptor with minimal required fields.
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            cost: 0,
            max_concurrency: default_concurrency(),
            health: AgentHealth::Healthy,
        }
    }

    /// Builder method to set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder method to add a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Builder method to set the cost weight.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Builder method to set the concurrency limit.
    pub fn with_max_concurrency(mut self, limit: u32) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Check if this agent declares a given capability.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Check if this agent declares every capability in `required`.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Number of capabilities from `wanted` this agent declares.
    pub fn matched(&self, wanted: &BTreeSet<String>) -> usize {
        wanted.intersection(&self.capabilities).count()
    }
}
