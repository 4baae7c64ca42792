//! Agent clients: the uniform interface every execution backend implements.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use cde_core::{DispatchId, DispatchResult, TaskDispatch};

use crate::error::AgentError;

/// Execution backend for dispatches.
///
/// `submit` must give up by `dispatch.deadline`; the supervisor enforces the
/// deadline independently and calls `cancel` when it passes.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run one dispatch to completion.
    async fn submit(&self, dispatch: TaskDispatch) -> Result<DispatchResult, AgentError>;

    /// Best-effort cancellation of an in-flight dispatch.
    async fn cancel(&self, dispatch_id: &DispatchId);
}

/// Runs a local command per dispatch.
///
/// The rendered prompt is appended as the final argument, the process runs
/// in the project root and sees `CDE_RUN_ID`, `CDE_PHASE` and
/// `CDE_DISPATCH_ID`. A zero exit is success; stdout is parsed as a JSON
/// [`DispatchResult`] when possible, otherwise its last non-empty line
/// becomes the summary.
#[derive(Debug, Clone)]
pub struct CommandAgentClient {
    /// Executable to run.
    program: String,

    /// Arguments placed before the prompt.
    args: Vec<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,

    /// Kill switches for in-flight dispatches.
    running: Arc<Mutex<HashMap<DispatchId, oneshot::Sender<()>>>>,
}

impl CommandAgentClient {
    /// Create a client for `program`, resolved through PATH if not absolute.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build from a command line: the first element is the program.
    pub fn from_command(command: &[String]) -> Result<Self, AgentError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AgentError::Unavailable("empty command line".to_string()))?;
        Ok(Self::new(program.clone()).with_args(args.iter().cloned()))
    }

    /// Append fixed arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Number of dispatches currently running.
    pub async fn in_flight(&self) -> usize {
        self.running.lock().await.len()
    }

    fn build_command(&self, dispatch: &TaskDispatch) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(dispatch.payload.prompt(&dispatch.phase))
            .current_dir(&dispatch.payload.root_path)
            .env("CDE_RUN_ID", dispatch.run_id.as_str())
            .env("CDE_PHASE", &dispatch.phase)
            .env("CDE_DISPATCH_ID", dispatch.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl AgentClient for CommandAgentClient {
    async fn submit(&self, dispatch: TaskDispatch) -> Result<DispatchResult, AgentError> {
        let child = self
            .build_command(&dispatch)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        info!(
            dispatch_id = %dispatch.id,
            agent_id = %dispatch.agent_id,
            phase = %dispatch.phase,
            pid = child.id().unwrap_or(0),
            "Agent process started"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.lock().await.insert(dispatch.id.clone(), kill_tx);

        // Dropping the wait future drops the child, which kills it.
        let outcome = tokio::select! {
            output = child.wait_with_output() => output.map_err(AgentError::from),
            _ = kill_rx => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(dispatch.remaining()) => Err(AgentError::DeadlineExceeded),
        };

        self.running.lock().await.remove(&dispatch.id);

        let output = outcome?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail = stderr.lines().last().unwrap_or("").to_string();
            warn!(
                dispatch_id = %dispatch.id,
                code = ?output.status.code(),
                "Agent process failed"
            );
            return Err(AgentError::Exited {
                code: output.status.code(),
                stderr: tail,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_result(&stdout))
    }

    async fn cancel(&self, dispatch_id: &DispatchId) {
        if let Some(kill) = self.running.lock().await.remove(dispatch_id) {
            debug!(dispatch_id = %dispatch_id, "Cancelling agent process");
            let _ = kill.send(());
        }
    }
}

fn parse_result(stdout: &str) -> DispatchResult {
    if let Ok(result) = serde_json::from_str::<DispatchResult>(stdout.trim()) {
        return result;
    }
    let summary = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("completed");
    DispatchResult::new(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cde_core::{AgentId, DispatchPayload, RunId};
    use std::time::Duration;

    fn dispatch(root: &str, timeout: Duration) -> TaskDispatch {
        TaskDispatch::new(
            RunId::new("run-1"),
            "implement",
            AgentId::new("local"),
            DispatchPayload {
                task: "add tests".to_string(),
                instructions: String::new(),
                root_path: root.to_string(),
            },
            timeout,
            1,
        )
    }

    #[test]
    fn test_parse_result() {
        let parsed = parse_result(r#"{"summary":"done","files_modified":["a.rs"]}"#);
        assert_eq!(parsed.files_modified, vec!["a.rs".to_string()]);
        assert_eq!(parse_result("step 1\nall good\n\n").summary, "all good");
        assert_eq!(parse_result("").summary, "completed");
    }

    #[test]
    fn test_from_command_rejects_empty() {
        assert!(CommandAgentClient::from_command(&[]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_success_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let client = CommandAgentClient::from_command(&[
            "sh".to_string(),
            "-c".to_string(),
            "echo \"$CDE_PHASE for $CDE_RUN_ID: $0\"".to_string(),
        ])
        .unwrap();

        let result = client
            .submit(dispatch(dir.path().to_str().unwrap(), Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(result.summary, "implement for run-1: [implement] add tests");
        assert_eq!(client.in_flight().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = CommandAgentClient::from_command(&[
            "sh".to_string(),
            "-c".to_string(),
            "echo boom >&2; exit 7".to_string(),
        ])
        .unwrap();

        let err = client
            .submit(dispatch(dir.path().to_str().unwrap(), Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Exited { code: Some(7), ref stderr } if stderr == "boom"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let client = CommandAgentClient::from_command(&[
            "sh".to_string(),
            "-c".to_string(),
            "sleep 5".to_string(),
        ])
        .unwrap();

        let err = client
            .submit(dispatch(dir.path().to_str().unwrap(), Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DeadlineExceeded));
    }
}
