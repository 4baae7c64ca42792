//! Orchestrator configuration.
//!
//! Everything has a default, so an empty YAML document is a valid config.
//! Agents, recipes and rules reach the orchestrator through a
//! [`ConfigProvider`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cde_core::{AgentDescriptor, AgentId, Recipe, RecipeRule};

use crate::error::ConfigError;
use crate::recipes::{builtin_recipes, builtin_rules, GENERIC_RECIPE};
use crate::registry::HealthPolicy;
use crate::scanner::ScanOptions;

/// Execution supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Per-attempt deadline for phases without their own timeout (milliseconds).
    pub default_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10 * 60 * 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// How long finished runs stay queryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Finished runs kept in memory; the oldest are evicted beyond this.
    pub max_finished_runs: usize,

    /// Write every finished run here as `<run_id>.json`. Evicted runs are
    /// still answered from this directory.
    pub archive_dir: Option<PathBuf>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_finished_runs: 256,
            archive_dir: None,
        }
    }
}

fn default_concurrency() -> u32 {
    1
}

/// One agent declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default)]
    pub cost: u32,

    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,

    /// Command line for a local agent; the prompt is appended as the last argument.
    #[serde(default)]
    pub command: Vec<String>,

    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentConfig {
    /// The registry-facing descriptor.
    pub fn descriptor(&self) -> AgentDescriptor {
        let mut descriptor = AgentDescriptor::new(AgentId::new(self.id.clone()))
            .with_description(self.description.clone())
            .with_cost(self.cost)
            .with_max_concurrency(self.max_concurrency);
        for capability in &self.capabilities {
            descriptor = descriptor.with_capability(capability.clone());
        }
        descriptor
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanOptions,
    pub health: HealthPolicy,
    pub supervisor: SupervisorConfig,
    pub retention: RetentionConfig,

    /// Recipe used when no rule matches.
    pub default_recipe: String,

    /// Merge the built-in recipes and rules with the ones declared here.
    pub builtin_recipes: bool,

    pub agents: Vec<AgentConfig>,
    pub recipes: Vec<Recipe>,
    pub rules: Vec<RecipeRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            health: HealthPolicy::default(),
            supervisor: SupervisorConfig::default(),
            retention: RetentionConfig::default(),
            default_recipe: GENERIC_RECIPE.to_string(),
            builtin_recipes: true,
            agents: Vec::new(),
            recipes: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }
}

/// Source of agents, recipes and rules.
pub trait ConfigProvider: Send + Sync {
    fn load_agents(&self) -> Result<Vec<AgentConfig>, ConfigError>;
    fn load_recipes(&self) -> Result<Vec<Recipe>, ConfigError>;
    fn load_rules(&self) -> Result<Vec<RecipeRule>, ConfigError>;
}

/// Built-in recipes and rules, no agents.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinConfigProvider;

impl ConfigProvider for BuiltinConfigProvider {
    fn load_agents(&self) -> Result<Vec<AgentConfig>, ConfigError> {
        Ok(Vec::new())
    }

    fn load_recipes(&self) -> Result<Vec<Recipe>, ConfigError> {
        Ok(builtin_recipes())
    }

    fn load_rules(&self) -> Result<Vec<RecipeRule>, ConfigError> {
        Ok(builtin_rules())
    }
}

/// Agents, recipes and rules from a parsed [`Config`].
///
/// Declared recipes replace built-ins of the same name; declared rules are
/// evaluated before built-in rules of equal specificity.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    config: Config,
}

impl FileConfigProvider {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Load from a YAML file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::new(Config::load(path)?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load_agents(&self) -> Result<Vec<AgentConfig>, ConfigError> {
        for agent in &self.config.agents {
            if agent.command.is_empty() {
                return Err(ConfigError::InvalidAgent {
                    id: agent.id.clone(),
                    message: "no command configured".to_string(),
                });
            }
        }
        Ok(self.config.agents.clone())
    }

    fn load_recipes(&self) -> Result<Vec<Recipe>, ConfigError> {
        let declared = &self.config.recipes;
        if !self.config.builtin_recipes {
            return Ok(declared.clone());
        }
        let mut recipes: Vec<Recipe> = builtin_recipes()
            .into_iter()
            .filter(|b| !declared.iter().any(|d| d.name == b.name))
            .collect();
        recipes.extend(declared.iter().cloned());
        Ok(recipes)
    }

    fn load_rules(&self) -> Result<Vec<RecipeRule>, ConfigError> {
        let mut rules = self.config.rules.clone();
        if self.config.builtin_recipes {
            rules.extend(builtin_rules());
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
scan:
  exclude_patterns: ["*.log"]
  timeout_ms: 5000
health:
  unavailable_after_failures: 5
supervisor:
  default_timeout_ms: 30000
retention:
  max_finished_runs: 10
  archive_dir: /var/lib/cde/runs
agents:
  - id: local-claude
    capabilities: [plan, code, docs]
    cost: 3
    command: ["claude", "-p"]
    env:
      CLAUDE_MODEL: sonnet
  - id: aider
    capabilities: [code, test]
    command: ["aider", "--yes", "--message"]
recipes:
  - name: release
    phases:
      - name: changelog
        required_capabilities: [docs]
        validation:
          type: path_exists
          pattern: "CHANGELOG.md"
rules:
  - recipe: release
    keywords: [release, changelog]
"#;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_yaml_str("").unwrap(), Config::default());
        assert_eq!(Config::from_yaml_str("{}").unwrap(), Config::default());
        assert!(Config::default().retention.archive_dir.is_none());
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.scan.timeout_ms, 5000);
        assert_eq!(config.scan.excluded_dirs, ScanOptions::default().excluded_dirs);
        assert_eq!(config.health.unavailable_after_failures, 5);
        assert_eq!(config.health.promote_after_successes, 2);
        assert_eq!(config.supervisor.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.retention.max_finished_runs, 10);
        assert_eq!(
            config.retention.archive_dir,
            Some(PathBuf::from("/var/lib/cde/runs"))
        );
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].max_concurrency, 1);

        let descriptor = config.agents[0].descriptor();
        assert!(descriptor.supports("docs"));
        assert_eq!(descriptor.cost, 3);
    }

    #[test]
    fn test_file_provider_merges_builtins() {
        let provider = FileConfigProvider::new(Config::from_yaml_str(SAMPLE).unwrap());
        let recipes = provider.load_recipes().unwrap();
        assert!(recipes.iter().any(|r| r.name == "release"));
        assert!(recipes.iter().any(|r| r.name == GENERIC_RECIPE));

        let rules = provider.load_rules().unwrap();
        assert_eq!(rules[0].recipe, "release");
        assert!(rules.len() > 1);
    }

    #[test]
    fn test_agent_without_command_rejected() {
        let config = Config::from_yaml_str("agents:\n  - id: ghost\n").unwrap();
        let err = FileConfigProvider::new(config).load_agents().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAgent { id, .. } if id == "ghost"));
    }

    #[test]
    fn test_unknown_field_type_is_parse_error() {
        assert!(matches!(
            Config::from_yaml_str("agents: 7"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load("/definitely/not/here.yaml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
