//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the orchestrator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Agent not found.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Recipe not found.
    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A phase was entered twice or out of order.
    #[error("Phase '{phase}' cannot start: {reason}")]
    PhaseOrder { phase: String, reason: String },

    /// Invalid glob pattern in a predicate or rule.
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
