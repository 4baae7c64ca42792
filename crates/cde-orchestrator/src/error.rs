//! Error types for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use cde_core::{exit_codes, CoreError, RunId};

/// Errors that abort a whole project scan.
///
/// Per-node failures never surface here; they become violations on the node.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Scan root does not exist.
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// Scan root exists but is not a directory.
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Scan root could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The total scan deadline elapsed.
    #[error("Scan timed out after {0:?}")]
    Timeout(Duration),

    /// The scan was cancelled by its caller.
    #[error("Scan cancelled")]
    Cancelled,

    /// An exclude pattern failed to compile.
    #[error("Invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// Internal matcher failed to compile.
    #[error("Invalid matcher: {0}")]
    Regex(#[from] regex::Error),

    /// Worker pool could not be built or a worker panicked.
    #[error("Scan worker error: {0}")]
    Worker(String),
}

/// Configuration and startup validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for the expected shape.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A recipe is malformed or a rule references an unknown recipe.
    #[error("Invalid recipe '{name}': {message}")]
    InvalidRecipe { name: String, message: String },

    /// The default recipe does not exist.
    #[error("No applicable recipe: default recipe '{0}' is not defined")]
    NoApplicableRecipe(String),

    /// An agent entry is malformed.
    #[error("Invalid agent '{id}': {message}")]
    InvalidAgent { id: String, message: String },

    /// Two agents share an id.
    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    /// Scanner options are invalid.
    #[error("Invalid scan options: {0}")]
    Scan(#[from] ScanError),
}

/// Errors reported by an agent client for one dispatch.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent process could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error while talking to the agent.
    #[error("Agent IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent process exited unsuccessfully.
    #[error("Agent exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Exited { code: Option<i32>, stderr: String },

    /// The agent reported that it could not complete the task.
    #[error("Agent reported failure: {0}")]
    Rejected(String),

    /// The dispatch deadline passed inside the client.
    #[error("Dispatch deadline exceeded")]
    DeadlineExceeded,

    /// The dispatch was cancelled.
    #[error("Dispatch cancelled")]
    Cancelled,

    /// The agent cannot accept work.
    #[error("Agent unavailable: {0}")]
    Unavailable(String),
}

/// Errors reading or writing archived runs.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Archive file or directory could not be accessed.
    #[error("Archive IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archived run is not valid JSON for a run.
    #[error("Archive JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run id cannot be used as a file name.
    #[error("Run id '{0}' cannot be archived")]
    InvalidRunId(RunId),
}

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request was rejected before a run was created.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No run with this id.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl OrchestratorError {
    /// Process exit code for a rejected request.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) | Self::Config(_) => exit_codes::INVALID_INPUT,
            _ => exit_codes::FAILED,
        }
    }
}
