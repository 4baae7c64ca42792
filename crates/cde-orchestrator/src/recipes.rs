//! Recipe selection and the built-in recipe catalogue.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use cde_core::{PhaseSpec, Recipe, RecipeRule, ScanReport, ValidationPredicate};

use crate::error::ConfigError;

/// Name of the catch-all recipe.
pub const GENERIC_RECIPE: &str = "generic";

/// Picks a recipe for a task from keyword and scan-signal rules.
///
/// Validated once at construction; selection itself is pure.
#[derive(Debug, Clone)]
pub struct RecipeSelector {
    recipes: Vec<Recipe>,
    /// Rules ordered most specific first.
    rules: Vec<RecipeRule>,
    /// Index of the default recipe in `recipes`.
    default_index: usize,
}

impl RecipeSelector {
    /// Validate the catalogue and order rules by specificity.
    pub fn new(
        recipes: Vec<Recipe>,
        mut rules: Vec<RecipeRule>,
        default_recipe: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let default_recipe = default_recipe.into();

        let mut names = HashSet::new();
        for recipe in &recipes {
            recipe.validate().map_err(|e| ConfigError::InvalidRecipe {
                name: recipe.name.clone(),
                message: e.to_string(),
            })?;
            if !names.insert(recipe.name.as_str()) {
                return Err(ConfigError::InvalidRecipe {
                    name: recipe.name.clone(),
                    message: "declared twice".to_string(),
                });
            }
        }

        for rule in &rules {
            if !names.contains(rule.recipe.as_str()) {
                return Err(ConfigError::InvalidRecipe {
                    name: rule.recipe.clone(),
                    message: "referenced by a rule but not defined".to_string(),
                });
            }
            for signal in &rule.when {
                signal.validate().map_err(|e| ConfigError::InvalidRecipe {
                    name: rule.recipe.clone(),
                    message: e.to_string(),
                })?;
            }
        }

        let default_index = recipes
            .iter()
            .position(|r| r.name == default_recipe)
            .ok_or(ConfigError::NoApplicableRecipe(default_recipe))?;

        rules.sort_by_key(|r| Reverse(r.specificity()));

        Ok(Self {
            recipes,
            rules,
            default_index,
        })
    }

    /// Selector over the built-in catalogue.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::new(builtin_recipes(), builtin_rules(), GENERIC_RECIPE)
    }

    /// First matching rule's recipe, or the default recipe.
    pub fn select_recipe(&self, task: &str, report: &ScanReport) -> &Recipe {
        let recipe = self
            .rules
            .iter()
            .filter(|rule| rule.matches(task, report))
            .find_map(|rule| self.recipe(&rule.recipe))
            .unwrap_or(&self.recipes[self.default_index]);
        debug!(recipe = %recipe.name, "Recipe selected");
        recipe
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.name == name)
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[RecipeRule] {
        &self.rules
    }

    pub fn default_recipe(&self) -> &str {
        &self.recipes[self.default_index].name
    }
}

fn tests_present() -> ValidationPredicate {
    ValidationPredicate::TestsPresent
}

fn docs_governed() -> ValidationPredicate {
    ValidationPredicate::AllOf {
        predicates: vec![
            ValidationPredicate::DocsPresent,
            ValidationPredicate::NoViolationsMatching {
                code: "missing-".to_string(),
            },
        ],
    }
}

/// Built-in recipes, one per supported workflow type plus the generic default.
pub fn builtin_recipes() -> Vec<Recipe> {
    vec![
        Recipe::new("standard")
            .with_description("Plan, implement and verify a feature")
            .with_phase(
                PhaseSpec::new("plan")
                    .with_instructions("Produce an implementation plan for the task.")
                    .requires("plan"),
            )
            .with_phase(
                PhaseSpec::new("implement")
                    .with_instructions("Implement the plan.")
                    .requires("code")
                    .prefers("test"),
            )
            .with_phase(
                PhaseSpec::new("verify")
                    .with_instructions("Add or update tests covering the change.")
                    .requires("test")
                    .with_validation(tests_present()),
            ),
        Recipe::new("quick-fix")
            .with_description("Small targeted fix with a test")
            .with_phase(
                PhaseSpec::new("fix")
                    .with_instructions("Make the smallest change that fixes the problem.")
                    .requires("code")
                    .prefers("test"),
            )
            .with_phase(
                PhaseSpec::new("verify")
                    .requires("test")
                    .with_validation(tests_present()),
            ),
        Recipe::new("research")
            .with_description("Investigate and write up findings")
            .with_phase(
                PhaseSpec::new("investigate")
                    .with_instructions("Investigate the question; do not change code.")
                    .requires("research"),
            )
            .with_phase(
                PhaseSpec::new("report")
                    .with_instructions("Write the findings as a Markdown document.")
                    .requires("docs")
                    .with_validation(ValidationPredicate::DocsPresent),
            ),
        Recipe::new("documentation")
            .with_description("Write or update governed documentation")
            .with_phase(
                PhaseSpec::new("outline")
                    .requires("docs")
                    .prefers("plan"),
            )
            .with_phase(
                PhaseSpec::new("write")
                    .with_instructions("Every document needs front-matter with a title.")
                    .requires("docs")
                    .with_validation(docs_governed()),
            )
            .with_phase(
                PhaseSpec::new("review")
                    .requires("review")
                    .prefers("docs")
                    .with_validation(ValidationPredicate::NoViolationsMatching {
                        code: "broken-link".to_string(),
                    }),
            ),
        Recipe::new("refactor")
            .with_description("Restructure code without changing behavior")
            .with_phase(
                PhaseSpec::new("analyze")
                    .requires("plan")
                    .prefers("research"),
            )
            .with_phase(
                PhaseSpec::new("refactor")
                    .requires("code")
                    .prefers("test"),
            )
            .with_phase(
                PhaseSpec::new("verify")
                    .requires("test")
                    .with_validation(tests_present()),
            ),
        Recipe::new("hotfix")
            .with_description("Production emergency: patch first, verify after")
            .with_phase(
                PhaseSpec::new("patch")
                    .requires("code")
                    .with_max_retries(3)
                    .with_timeout(Duration::from_secs(900)),
            )
            .with_phase(
                PhaseSpec::new("verify")
                    .requires("test")
                    .with_validation(tests_present()),
            ),
        Recipe::new(GENERIC_RECIPE)
            .with_description("Single catch-all phase")
            .with_phase(PhaseSpec::new("execute")),
    ]
}

/// Keyword rules for the built-in recipes. Declared order breaks ties.
pub fn builtin_rules() -> Vec<RecipeRule> {
    vec![
        RecipeRule::new("hotfix").with_keywords(&[
            "production down",
            "critical bug",
            "security issue",
            "data loss",
            "outage",
            "broken prod",
        ]),
        RecipeRule::new("quick-fix").with_keywords(&[
            "quick",
            "hotfix",
            "urgent",
            "emergency",
            "asap",
            "bug fix",
            "broken",
            "not working",
            "crash",
        ]),
        RecipeRule::new("research").with_keywords(&[
            "research",
            "investigate",
            "analyze",
            "explore",
            "compare",
            "evaluate",
        ]),
        RecipeRule::new("documentation").with_keywords(&[
            "document",
            "write spec",
            "create guide",
            "add docs",
            "explain",
            "tutorial",
            "readme",
            "api docs",
        ]),
        RecipeRule::new("refactor").with_keywords(&[
            "refactor",
            "clean up",
            "improve",
            "optimize",
            "restructure",
            "modernize",
            "technical debt",
            "code quality",
        ]),
        RecipeRule::new("standard").with_keywords(&[
            "feature",
            "implement",
            "add",
            "build",
            "create",
        ]),
    ]
}
