//! Recipes, phases, validation predicates and selection rules.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use globset::Glob;
use serde::{Deserialize, Serialize};

use crate::scan::{NodeKind, ScanReport};
use crate::CoreError;

/// A check evaluated against a [`ScanReport`].
///
/// Used both as a phase's post-condition and as a recipe rule's scan signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationPredicate {
    /// Always passes.
    #[default]
    Always,
    /// At least one test file exists.
    TestsPresent,
    /// At least one Markdown document exists.
    DocsPresent,
    /// A manifest with this file name exists.
    ManifestPresent { name: String },
    /// At least one node path matches the glob.
    PathExists { pattern: String },
    /// The report has no violations at all.
    NoViolations,
    /// No violation code starts with `code`.
    NoViolationsMatching { code: String },
    /// At most `count` violations.
    MaxViolations { count: usize },
    AllOf { predicates: Vec<ValidationPredicate> },
    AnyOf { predicates: Vec<ValidationPredicate> },
    Not { predicate: Box<ValidationPredicate> },
}

impl ValidationPredicate {
    /// Evaluate against a report. Invalid glob patterns never match.
    pub fn evaluate(&self, report: &ScanReport) -> bool {
        match self {
            Self::Always => true,
            Self::TestsPresent => report.has_kind(NodeKind::Test),
            Self::DocsPresent => report.has_kind(NodeKind::Document),
            Self::ManifestPresent { name } => report.has_manifest(name),
            Self::PathExists { pattern } => match Glob::new(pattern) {
                Ok(glob) => {
                    let matcher = glob.compile_matcher();
                    report.nodes.iter().any(|n| matcher.is_match(&n.path))
                }
                Err(_) => false,
            },
            Self::NoViolations => report.is_clean(),
            Self::NoViolationsMatching { code } => {
                !report.violations().any(|(_, v)| v.code.starts_with(code.as_str()))
            }
            Self::MaxViolations { count } => report.summary.violations <= *count,
            Self::AllOf { predicates } => predicates.iter().all(|p| p.evaluate(report)),
            Self::AnyOf { predicates } => predicates.iter().any(|p| p.evaluate(report)),
            Self::Not { predicate } => !predicate.evaluate(report),
        }
    }

    /// Check that every glob pattern in this predicate compiles.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::PathExists { pattern } => {
                Glob::new(pattern)
                    .map(|_| ())
                    .map_err(|e| CoreError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })
            }
            Self::AllOf { predicates } | Self::AnyOf { predicates } => {
                predicates.iter().try_for_each(|p| p.validate())
            }
            Self::Not { predicate } => predicate.validate(),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ValidationPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::TestsPresent => write!(f, "tests present"),
            Self::DocsPresent => write!(f, "docs present"),
            Self::ManifestPresent { name } => write!(f, "manifest '{name}' present"),
            Self::PathExists { pattern } => write!(f, "path matching '{pattern}' exists"),
            Self::NoViolations => write!(f, "no violations"),
            Self::NoViolationsMatching { code } => write!(f, "no '{code}' violations"),
            Self::MaxViolations { count } => write!(f, "at most {count} violations"),
            Self::AllOf { predicates } => write_joined(f, "all of", predicates),
            Self::AnyOf { predicates } => write_joined(f, "any of", predicates),
            Self::Not { predicate } => write!(f, "not ({predicate})"),
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    predicates: &[ValidationPredicate],
) -> fmt::Result {
    write!(f, "{label} [")?;
    for (idx, p) in predicates.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{p}")?;
    }
    write!(f, "]")
}

fn default_max_retries() -> u32 {
    2
}

/// One ordered step of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Phase name, unique within the recipe.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Instructions forwarded to the agent with the task description.
    #[serde(default)]
    pub instructions: String,

    /// Capabilities an agent must declare to be eligible.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,

    /// Capabilities that rank an eligible agent higher.
    #[serde(default)]
    pub preferred_capabilities: BTreeSet<String>,

    /// Post-condition checked against a fresh scan after the agent succeeds.
    #[serde(default)]
    pub validation: ValidationPredicate,

    /// Retries shared by all candidates; attempts never exceed `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt deadline; the supervisor default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PhaseSpec {
    /// Create a phase with no requirements that always validates.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            required_capabilities: BTreeSet::new(),
            preferred_capabilities: BTreeSet::new(),
            validation: ValidationPredicate::Always,
            max_retries: default_max_retries(),
            timeout_ms: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Builder method to require a capability.
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Builder method to prefer a capability.
    pub fn prefers(mut self, capability: impl Into<String>) -> Self {
        self.preferred_capabilities.insert(capability.into());
        self
    }

    pub fn with_validation(mut self, predicate: ValidationPredicate) -> Self {
        self.validation = predicate;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Per-attempt deadline, if the phase overrides the default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Upper bound on dispatch attempts for this phase.
    pub fn max_attempts(&self) -> usize {
        self.max_retries as usize + 1
    }
}

/// Ordered phase sequence selected per task. Immutable once selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub phases: Vec<PhaseSpec>,
}

impl Recipe {
    /// Create an empty recipe.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            phases: Vec::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder method to append a phase.
    pub fn with_phase(mut self, phase: PhaseSpec) -> Self {
        self.phases.push(phase);
        self
    }

    /// Get a phase by name.
    pub fn phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phase names in order.
    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }

    /// Structural checks performed at startup.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("recipe name is empty".to_string()));
        }
        if self.phases.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "recipe '{}' has no phases",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "recipe '{}' has a phase with an empty name",
                    self.name
                )));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(CoreError::InvalidInput(format!(
                    "recipe '{}' declares phase '{}' twice",
                    self.name, phase.name
                )));
            }
            phase.validation.validate()?;
        }
        Ok(())
    }
}

/// Maps task keywords and scan signals to a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeRule {
    /// Name of the recipe this rule selects.
    pub recipe: String,

    /// The rule applies when any keyword occurs in the task (or when empty).
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Scan signals that must all hold.
    #[serde(default)]
    pub when: Vec<ValidationPredicate>,
}

impl RecipeRule {
    /// Create a rule with no conditions.
    pub fn new(recipe: impl Into<String>) -> Self {
        Self {
            recipe: recipe.into(),
            keywords: Vec::new(),
            when: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords.extend(keywords.iter().map(|k| k.to_string()));
        self
    }

    pub fn when(mut self, signal: ValidationPredicate) -> Self {
        self.when.push(signal);
        self
    }

    /// Number of conditions; rules with more conditions are tried first.
    pub fn specificity(&self) -> usize {
        usize::from(!self.keywords.is_empty()) + self.when.len()
    }

    /// Whole-word, case-insensitive keyword check.
    pub fn matches_keywords(&self, task: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let haystack = normalize_words(task);
        self.keywords.iter().any(|k| {
            let needle = normalize_words(k);
            !needle.trim().is_empty() && haystack.contains(&needle)
        })
    }

    /// Check every scan signal against the report.
    pub fn matches_signals(&self, report: &ScanReport) -> bool {
        self.when.iter().all(|signal| signal.evaluate(report))
    }

    pub fn matches(&self, task: &str, report: &ScanReport) -> bool {
        self.matches_keywords(task) && self.matches_signals(report)
    }
}

/// Lowercase, collapse non-alphanumerics to single spaces, and pad with
/// spaces so substring search only hits whole words.
fn normalize_words(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        out.push_str(&word.to_lowercase());
        out.push(' ');
    }
    out
}
