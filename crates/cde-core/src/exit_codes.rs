//! Exit code constants surfaced to callers of the orchestrator.
//!
//! - 0: Run succeeded
//! - 1: Run failed
//! - 2: Run blocked by a validation gate (needs human intervention)
//! - 3: Invalid input (bad root path, unknown recipe)

/// Every phase succeeded.
pub const SUCCEEDED: i32 = 0;

/// The run failed: no eligible agent, exhausted candidates, or cancellation.
pub const FAILED: i32 = 1;

/// An agent claimed success but the project state did not satisfy the phase.
pub const BLOCKED: i32 = 2;

/// The request was rejected before any agent was invoked.
pub const INVALID_INPUT: i32 = 3;
