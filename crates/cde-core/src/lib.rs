//! CDE Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Filesystem walking
//! - Agent provider clients
//!
//! All types here describe workflow runs, recipes, agents, dispatches and
//! scan reports. The orchestrator crate owns all behavior that needs IO.

pub mod agent;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod ids;
pub mod recipe;
pub mod run;
pub mod scan;
pub mod status;

// Re-export commonly used types
pub use agent::AgentDescriptor;
pub use dispatch::{DispatchPayload, DispatchResult, TaskDispatch};
pub use error::CoreError;
pub use ids::{AgentId, DispatchId, RunId};
pub use recipe::{PhaseSpec, Recipe, RecipeRule, ValidationPredicate};
pub use run::{AttemptOutcome, AttemptRecord, PhaseRecord, RunError, WorkflowRun};
pub use scan::{NodeKind, ScanNode, ScanReport, ScanSummary, Violation};
pub use status::{AgentHealth, PhaseStatus, RunStatus};
