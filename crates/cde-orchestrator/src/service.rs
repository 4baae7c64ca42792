//! Orchestrator service - accepts workflow requests and runs them in the
//! background.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use cde_core::{Recipe, RunError, RunId, WorkflowRun};

use crate::archive::RunArchive;
use crate::client::CommandAgentClient;
use crate::config::{Config, ConfigProvider, FileConfigProvider};
use crate::error::{ArchiveError, ConfigError, OrchestratorError, ScanError};
use crate::metrics;
use crate::recipes::RecipeSelector;
use crate::registry::AgentRegistry;
use crate::scanner::Scanner;
use crate::selector::AgentSelector;
use crate::supervisor::{ExecutionSupervisor, RunContext};
use crate::workflow::WorkflowMachine;

/// A request to run a workflow over a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRequest {
    /// Free-text task description.
    pub task: String,

    /// Project root directory.
    pub root: PathBuf,

    /// Run this recipe instead of selecting one.
    pub recipe: Option<String>,
}

impl WorkflowRequest {
    pub fn new(task: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            task: task.into(),
            root: root.into(),
            recipe: None,
        }
    }

    /// Builder method to force a recipe.
    pub fn with_recipe(mut self, recipe: impl Into<String>) -> Self {
        self.recipe = Some(recipe.into());
        self
    }
}

/// Live view of one run.
struct RunHandle {
    snapshot: watch::Receiver<WorkflowRun>,
    cancel: CancellationToken,
}

type RunTable = Arc<RwLock<HashMap<RunId, RunHandle>>>;

/// Entry point for callers: starts runs and answers questions about them.
///
/// Runs progress concurrently on the tokio runtime. Each run is owned by its
/// background task; callers only ever see snapshots.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    recipes: Arc<RecipeSelector>,
    scanner: Arc<Scanner>,
    machine: WorkflowMachine,

    /// Active and recently finished runs indexed by RunId.
    runs: RunTable,

    /// Finished runs kept in `runs`.
    max_finished_runs: usize,
    archive: Option<RunArchive>,

    tracker: TaskTracker,

    /// Parent of every run's cancellation token.
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator over an existing registry and recipe catalogue.
    pub fn new(
        config: &Config,
        registry: Arc<AgentRegistry>,
        recipes: RecipeSelector,
    ) -> Result<Self, OrchestratorError> {
        let scanner = Arc::new(Scanner::new(config.scan.clone())?);
        let selector = AgentSelector::new(Arc::clone(&registry));
        let supervisor =
            ExecutionSupervisor::new(Arc::clone(&registry), config.supervisor.default_timeout());
        let machine = WorkflowMachine::new(selector, supervisor, Arc::clone(&scanner));

        let archive = config.retention.archive_dir.clone().map(RunArchive::new);
        if let Some(archive) = &archive {
            info!(dir = %archive.dir().display(), "Archiving finished runs");
        }

        info!(
            agents = registry.len(),
            recipes = recipes.recipes().len(),
            default_recipe = recipes.default_recipe(),
            max_finished_runs = config.retention.max_finished_runs,
            "Orchestrator ready"
        );

        Ok(Self {
            registry,
            recipes: Arc::new(recipes),
            scanner,
            machine,
            runs: Arc::new(RwLock::new(HashMap::new())),
            max_finished_runs: config.retention.max_finished_runs,
            archive,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build everything from a provider. Every declared agent gets a
    /// [`CommandAgentClient`].
    pub fn from_provider(
        config: &Config,
        provider: &dyn ConfigProvider,
    ) -> Result<Self, OrchestratorError> {
        let mut registry = AgentRegistry::new(config.health.clone());
        for agent in provider.load_agents()? {
            let client = CommandAgentClient::from_command(&agent.command).map_err(|e| {
                ConfigError::InvalidAgent {
                    id: agent.id.clone(),
                    message: e.to_string(),
                }
            })?;
            let client = agent
                .env
                .iter()
                .fold(client, |client, (key, value)| client.with_env(key, value));
            registry.register(agent.descriptor(), Arc::new(client))?;
        }

        let recipes = RecipeSelector::new(
            provider.load_recipes()?,
            provider.load_rules()?,
            config.default_recipe.clone(),
        )?;
        Self::new(config, Arc::new(registry), recipes)
    }

    /// Build everything from a parsed config file.
    pub fn from_config(config: &Config) -> Result<Self, OrchestratorError> {
        let provider = FileConfigProvider::new(config.clone());
        Self::from_provider(config, &provider)
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn recipes(&self) -> &RecipeSelector {
        &self.recipes
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    /// Start a run with recipe selection. Returns once the run is accepted.
    pub async fn start_workflow(
        &self,
        task: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Result<RunId, OrchestratorError> {
        self.submit(WorkflowRequest::new(task, root)).await
    }

    /// Validate a request and start its run in the background.
    ///
    /// Rejected requests never create a run and never reach an agent.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<RunId, OrchestratorError> {
        let task = request.task.trim();
        if task.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "task description is empty".to_string(),
            ));
        }
        let root = validate_root(&request.root).await?;
        let forced = match &request.recipe {
            Some(name) => Some(self.recipes.recipe(name).cloned().ok_or_else(|| {
                OrchestratorError::InvalidInput(format!("unknown recipe '{name}'"))
            })?),
            None => None,
        };
        if self.tracker.is_closed() {
            return Err(OrchestratorError::InvalidInput(
                "orchestrator is shutting down".to_string(),
            ));
        }

        let run = WorkflowRun::new(task, root.display().to_string());
        let run_id = run.id.clone();
        let (publish, snapshot) = watch::channel(run.clone());
        let cancel = self.shutdown.child_token();

        self.runs.write().await.insert(
            run_id.clone(),
            RunHandle {
                snapshot,
                cancel: cancel.clone(),
            },
        );

        let ctx = RunContext {
            run_id: run_id.clone(),
            task: task.to_string(),
            root,
            cancel,
        };
        let job = RunJob {
            recipes: Arc::clone(&self.recipes),
            scanner: Arc::clone(&self.scanner),
            machine: self.machine.clone(),
            runs: Arc::clone(&self.runs),
            max_finished_runs: self.max_finished_runs,
            archive: self.archive.clone(),
        };
        self.tracker.spawn(job.execute(run, ctx, forced, publish));

        info!(
            run_id = %run_id,
            root = %request.root.display(),
            recipe = request.recipe.as_deref().unwrap_or("auto"),
            "Run accepted"
        );
        Ok(run_id)
    }

    /// Latest snapshot of a run. Evicted runs are read back from the archive.
    pub async fn get_run_status(&self, run_id: &RunId) -> Option<WorkflowRun> {
        let live = {
            let runs = self.runs.read().await;
            runs.get(run_id).map(|h| h.snapshot.borrow().clone())
        };
        if live.is_some() {
            return live;
        }
        match self.archived(run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Archived run unreadable");
                None
            }
        }
    }

    /// Request cancellation. A finished run is left as it is.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<(), OrchestratorError> {
        let live = {
            let runs = self.runs.read().await;
            runs.get(run_id)
                .map(|h| (h.snapshot.borrow().is_terminal(), h.cancel.clone()))
        };
        let Some((finished, cancel)) = live else {
            return match self.archived(run_id).await? {
                Some(_) => Ok(()),
                None => Err(OrchestratorError::RunNotFound(run_id.clone())),
            };
        };

        if finished {
            return Ok(());
        }
        info!(run_id = %run_id, "Cancelling run");
        cancel.cancel();
        Ok(())
    }

    /// Wait until a run reaches a terminal status and return it.
    pub async fn wait_for_run(&self, run_id: &RunId) -> Result<WorkflowRun, OrchestratorError> {
        let mut rx = self.subscribe(run_id).await?;
        let terminal = rx
            .wait_for(WorkflowRun::is_terminal)
            .await
            .map(|run| run.clone());
        let run = match terminal {
            Ok(run) => run,
            // The run task ended without a terminal snapshot.
            Err(_) => rx.borrow().clone(),
        };
        Ok(run)
    }

    /// Stream of snapshots, starting with the current one.
    pub async fn watch_run(
        &self,
        run_id: &RunId,
    ) -> Result<WatchStream<WorkflowRun>, OrchestratorError> {
        Ok(WatchStream::new(self.subscribe(run_id).await?))
    }

    /// Snapshots of every run still held in memory, oldest first.
    pub async fn list_runs(&self) -> Vec<WorkflowRun> {
        let runs = self.runs.read().await;
        let mut out: Vec<WorkflowRun> = runs
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        out
    }

    /// Prometheus text for agents and runs.
    pub async fn metrics(&self) -> String {
        metrics::collect_metrics(self).await
    }

    /// Cancel every active run and wait for all run tasks to finish.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn subscribe(
        &self,
        run_id: &RunId,
    ) -> Result<watch::Receiver<WorkflowRun>, OrchestratorError> {
        let live = {
            let runs = self.runs.read().await;
            runs.get(run_id).map(|h| h.snapshot.clone())
        };
        if let Some(rx) = live {
            return Ok(rx);
        }
        // An archived run never changes again: one snapshot, then a closed channel.
        let run = self
            .archived(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))?;
        let (_, rx) = watch::channel(run);
        Ok(rx)
    }

    async fn archived(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, ArchiveError> {
        let Some(archive) = &self.archive else {
            return Ok(None);
        };
        match archive.load(run_id).await {
            Err(ArchiveError::InvalidRunId(_)) => Ok(None),
            other => other,
        }
    }
}

/// Drop the oldest finished runs beyond `keep`. Active runs are never evicted.
fn evict_finished(runs: &mut HashMap<RunId, RunHandle>, keep: usize) -> usize {
    let mut finished: Vec<(DateTime<Utc>, RunId)> = runs
        .iter()
        .filter_map(|(id, handle)| {
            let run = handle.snapshot.borrow();
            run.is_terminal()
                .then(|| (run.finished_at.unwrap_or(run.updated_at), id.clone()))
        })
        .collect();
    if finished.len() <= keep {
        return 0;
    }

    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    excess
}

async fn validate_root(root: &Path) -> Result<PathBuf, OrchestratorError> {
    let meta = tokio::fs::metadata(root).await.map_err(|e| {
        OrchestratorError::InvalidInput(format!("root {} is not accessible: {e}", root.display()))
    })?;
    if !meta.is_dir() {
        return Err(OrchestratorError::InvalidInput(format!(
            "root {} is not a directory",
            root.display()
        )));
    }
    tokio::fs::canonicalize(root).await.map_err(|e| {
        OrchestratorError::InvalidInput(format!("root {} is not accessible: {e}", root.display()))
    })
}

/// What a background run needs from the orchestrator.
struct RunJob {
    recipes: Arc<RecipeSelector>,
    scanner: Arc<Scanner>,
    machine: WorkflowMachine,
    runs: RunTable,
    max_finished_runs: usize,
    archive: Option<RunArchive>,
}

impl RunJob {
    async fn execute(
        self,
        run: WorkflowRun,
        ctx: RunContext,
        forced: Option<Recipe>,
        publish: watch::Sender<WorkflowRun>,
    ) {
        let Some(run) = self.run(run, &ctx, forced, &publish).await else {
            return;
        };

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.store(&run).await {
                warn!(run_id = %run.id, error = %e, "Failed to archive run");
            }
        }

        let evicted = evict_finished(&mut *self.runs.write().await, self.max_finished_runs);
        if evicted > 0 {
            debug!(run_id = %run.id, evicted, "Evicted finished runs");
        }
    }

    /// Drive the run to a terminal status. `None` if it never started.
    async fn run(
        &self,
        mut run: WorkflowRun,
        ctx: &RunContext,
        forced: Option<Recipe>,
        publish: &watch::Sender<WorkflowRun>,
    ) -> Option<WorkflowRun> {
        if let Err(e) = run.start() {
            error!(run_id = %run.id, error = %e, "Run could not start");
            return None;
        }
        publish.send_replace(run.clone());

        let recipe = match forced {
            Some(recipe) => recipe,
            None => match self.scanner.scan(&ctx.root, &ctx.cancel).await {
                Ok(report) => self.recipes.select_recipe(&ctx.task, &report).clone(),
                Err(ScanError::Cancelled) => {
                    abort(&mut run, RunError::CancellationRequested, publish);
                    return Some(run);
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Initial scan failed");
                    abort(
                        &mut run,
                        RunError::ScanFailed {
                            message: e.to_string(),
                        },
                        publish,
                    );
                    return Some(run);
                }
            },
        };

        if let Err(e) = run.assign_recipe(&recipe) {
            abort(
                &mut run,
                RunError::Internal {
                    message: e.to_string(),
                },
                publish,
            );
            return Some(run);
        }
        publish.send_replace(run.clone());
        info!(
            run_id = %run.id,
            recipe = %recipe.name,
            phases = recipe.phases.len(),
            "Recipe assigned"
        );

        Some(self.machine.drive(run, &recipe, ctx, publish).await)
    }
}

fn abort(run: &mut WorkflowRun, error: RunError, publish: &watch::Sender<WorkflowRun>) {
    info!(run_id = %run.id, error = %error, "Run aborted before its first phase");
    if let Err(e) = run.fail(error) {
        error!(run_id = %run.id, error = %e, "Run could not be failed");
    }
    publish.send_replace(run.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuiltinConfigProvider;
    use cde_core::RunStatus;
    use tokio_stream::StreamExt;

    fn orchestrator() -> Orchestrator {
        Orchestrator::from_provider(&Config::default(), &BuiltinConfigProvider).unwrap()
    }

    fn retaining(max_finished_runs: usize, archive_dir: Option<PathBuf>) -> Orchestrator {
        let mut config = Config::default();
        config.retention.max_finished_runs = max_finished_runs;
        config.retention.archive_dir = archive_dir;
        Orchestrator::from_provider(&config, &BuiltinConfigProvider).unwrap()
    }

    async fn finish_runs(orchestrator: &Orchestrator, root: &Path, count: usize) -> Vec<RunId> {
        let mut ids = Vec::new();
        for i in 0..count {
            let id = orchestrator
                .start_workflow(format!("Rename variable {i}"), root)
                .await
                .unwrap();
            orchestrator.wait_for_run(&id).await.unwrap();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn test_empty_task_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = orchestrator()
            .start_workflow("   ", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_file_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "x").unwrap();

        let orchestrator = orchestrator();
        let err = orchestrator.start_workflow("fix it", &file).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(orchestrator.list_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipe_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request = WorkflowRequest::new("fix it", dir.path()).with_recipe("nope");
        let err = orchestrator().submit(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_no_agents_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator();
        let run_id = orchestrator
            .start_workflow("Rename a variable", dir.path())
            .await
            .unwrap();

        let run = orchestrator.wait_for_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.recipe.as_deref(), Some("generic"));
        assert!(matches!(run.error, Some(RunError::NoEligibleAgent { ref phase }) if phase == "execute"));
        assert_eq!(run.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let orchestrator = orchestrator();
        let id = RunId::new("missing");
        assert!(orchestrator.get_run_status(&id).await.is_none());
        assert!(matches!(
            orchestrator.cancel_run(&id).await,
            Err(OrchestratorError::RunNotFound(_))
        ));
        assert!(orchestrator.wait_for_run(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator();
        orchestrator.shutdown().await;
        assert!(orchestrator.start_workflow("fix it", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_runs_evicted_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = retaining(2, None);

        let ids = finish_runs(&orchestrator, dir.path(), 4).await;
        // Every run task has done its bookkeeping once shutdown returns.
        orchestrator.shutdown().await;

        let kept: Vec<RunId> = orchestrator
            .list_runs()
            .await
            .into_iter()
            .map(|run| run.id)
            .collect();
        assert_eq!(kept, ids[2..].to_vec());
        assert!(orchestrator.get_run_status(&ids[0]).await.is_none());
        assert!(matches!(
            orchestrator.cancel_run(&ids[0]).await,
            Err(OrchestratorError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_evicted_runs_answered_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = dir.path().join("archive");
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        let orchestrator = retaining(1, Some(archive_dir.clone()));

        let ids = finish_runs(&orchestrator, &root, 3).await;
        orchestrator.shutdown().await;

        assert_eq!(orchestrator.list_runs().await.len(), 1);
        assert!(archive_dir.join(format!("{}.json", ids[0])).is_file());

        let first = orchestrator.get_run_status(&ids[0]).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        assert_eq!(first.task_description, "Rename variable 0");
        assert_eq!(orchestrator.wait_for_run(&ids[0]).await.unwrap(), first);
        orchestrator.cancel_run(&ids[0]).await.unwrap();

        let mut updates = orchestrator.watch_run(&ids[1]).await.unwrap();
        assert_eq!(updates.next().await.map(|run| run.id), Some(ids[1].clone()));
        assert!(updates.next().await.is_none());
    }
}
