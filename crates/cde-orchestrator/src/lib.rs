//! CDE Orchestrator Library
//!
//! This crate turns a task description and a project directory into a
//! supervised multi-phase workflow: it scans the project, selects a recipe,
//! dispatches each phase to a ranked agent and validates the result against
//! a fresh scan.

pub mod archive;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod recipes;
pub mod registry;
pub mod scanner;
pub mod selector;
pub mod service;
pub mod supervisor;
pub mod workflow;

pub use archive::RunArchive;
pub use client::{AgentClient, CommandAgentClient};
pub use config::{
    BuiltinConfigProvider, Config, ConfigProvider, FileConfigProvider, RetentionConfig,
};
pub use error::{AgentError, ArchiveError, ConfigError, OrchestratorError, ScanError};
pub use recipes::RecipeSelector;
pub use registry::{AgentRegistry, HealthOutcome, HealthPolicy};
pub use scanner::{ScanOptions, Scanner};
pub use selector::AgentSelector;
pub use service::{Orchestrator, WorkflowRequest};
pub use supervisor::{ExecutionSupervisor, PhaseOutcome, RunContext};
pub use workflow::WorkflowMachine;
