//! Shared fixtures: scripted agents and throwaway project trees.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cde_core::{AgentDescriptor, DispatchId, DispatchResult, Recipe, RecipeRule, TaskDispatch};
use cde_orchestrator::{
    AgentClient, AgentError, AgentRegistry, Config, HealthPolicy, Orchestrator, RecipeSelector,
};

/// What a scripted agent does with every dispatch.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(&'static str),
    /// Never answers; only a deadline or cancellation ends the dispatch.
    Hang,
    /// Write a file under the project root, then succeed.
    Write(&'static str),
    /// Remove the whole project root, then succeed.
    DeleteRoot,
}

/// In-memory agent that records the phases it was asked to run.
pub struct ScriptedAgent {
    script: Script,
    calls: Mutex<Vec<String>>,
    cancels: Mutex<Vec<DispatchId>>,
}

impl ScriptedAgent {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn submit(&self, dispatch: TaskDispatch) -> Result<DispatchResult, AgentError> {
        self.calls.lock().unwrap().push(dispatch.phase.clone());
        match &self.script {
            Script::Succeed => Ok(DispatchResult::new(format!("{} done", dispatch.phase))),
            Script::Fail(message) => Err(AgentError::Rejected(message.to_string())),
            Script::Hang => std::future::pending().await,
            Script::Write(rel) => {
                let path = Path::new(&dispatch.payload.root_path).join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, "#[test]\nfn it_works() {}\n")?;
                Ok(DispatchResult::new(format!("wrote {rel}")))
            }
            Script::DeleteRoot => {
                fs::remove_dir_all(&dispatch.payload.root_path)?;
                Ok(DispatchResult::new("removed the project"))
            }
        }
    }

    async fn cancel(&self, dispatch_id: &DispatchId) {
        self.cancels.lock().unwrap().push(dispatch_id.clone());
    }
}

/// A small Rust project without tests.
pub fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    fs::write(root.join("src/lib.rs"), "pub fn add(a: i32, b: i32) -> i32 { a + b }\n").unwrap();
    fs::write(
        root.join("docs/guide.md"),
        "---\ntitle: Guide\n---\n# Guide\n\nSee [the code](../src/lib.rs).\n",
    )
    .unwrap();
    dir
}

/// Path under a temp dir that does not exist.
pub fn missing_root(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("does-not-exist")
}

/// Orchestrator over the given agents and recipe, with `recipe` as default.
pub fn orchestrator(
    agents: Vec<(AgentDescriptor, Arc<dyn AgentClient>)>,
    recipe: Recipe,
    policy: HealthPolicy,
) -> Orchestrator {
    let mut registry = AgentRegistry::new(policy.clone());
    for (descriptor, client) in agents {
        registry.register(descriptor, client).unwrap();
    }
    let name = recipe.name.clone();
    let recipes = RecipeSelector::new(vec![recipe], Vec::<RecipeRule>::new(), name).unwrap();
    let config = Config {
        health: policy,
        ..Config::default()
    };
    Orchestrator::new(&config, Arc::new(registry), recipes).unwrap()
}

pub fn timeout_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
