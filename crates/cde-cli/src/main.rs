//! CDE CLI - run supervised agent workflows over a project directory.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cde_core::exit_codes;
use cde_orchestrator::{
    Config, ConfigProvider, FileConfigProvider, Orchestrator, RecipeSelector, ScanError, Scanner,
    WorkflowRequest,
};

/// CDE - multi-agent workflow orchestrator
#[derive(Parser)]
#[command(name = "cde")]
#[command(about = "Supervised multi-phase agent workflows", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and print the final run as JSON
    Run {
        /// Task description
        #[arg(short, long)]
        task: String,

        /// Project root directory
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Run this recipe instead of selecting one
        #[arg(long)]
        recipe: Option<String>,

        /// Print Prometheus metrics to stderr when the run ends
        #[arg(long)]
        metrics: bool,
    },

    /// Scan a project directory
    Scan {
        /// Directory to scan
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recipes and selection rules
    Recipes,

    /// List configured agents
    Agents,

    /// Validate the configuration
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(exit_codes::INVALID_INPUT);
        }
    };

    let code = match cli.command {
        Commands::Run {
            task,
            root,
            recipe,
            metrics,
        } => run_workflow(&config, task, root, recipe, metrics).await?,
        Commands::Scan { dir, json } => scan(&config, &dir, json).await?,
        Commands::Recipes => list_recipes(&config)?,
        Commands::Agents => list_agents(&config)?,
        Commands::CheckConfig => check_config(&config),
    };

    if code != exit_codes::SUCCEEDED {
        std::process::exit(code);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            Ok(Config::load(path)?)
        }
        None => Ok(Config::default()),
    }
}

async fn run_workflow(
    config: &Config,
    task: String,
    root: PathBuf,
    recipe: Option<String>,
    metrics: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let orchestrator = match Orchestrator::from_config(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(e.exit_code());
        }
    };

    let mut request = WorkflowRequest::new(task, root);
    if let Some(recipe) = recipe {
        request = request.with_recipe(recipe);
    }
    let run_id = match orchestrator.submit(request).await {
        Ok(run_id) => run_id,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(e.exit_code());
        }
    };

    let mut interrupted = false;
    let run = tokio::select! {
        run = orchestrator.wait_for_run(&run_id) => run?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            interrupted = true;
            orchestrator.cancel_run(&run_id).await?;
            orchestrator.wait_for_run(&run_id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&run)?);
    if metrics {
        eprint!("{}", orchestrator.metrics().await);
    }
    orchestrator.shutdown().await;

    info!(
        run_id = %run.id,
        status = run.status.as_str(),
        interrupted,
        "Run complete"
    );
    Ok(run.exit_code())
}

async fn scan(config: &Config, dir: &Path, json: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let scanner = Scanner::new(config.scan.clone())?;
    let report = match scanner.scan(dir, &CancellationToken::new()).await {
        Ok(report) => report,
        Err(e @ (ScanError::PathNotFound(_) | ScanError::NotADirectory(_))) => {
            eprintln!("Error: {e}");
            return Ok(exit_codes::INVALID_INPUT);
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(exit_codes::SUCCEEDED);
    }

    let summary = &report.summary;
    println!("Root:        {}", report.root);
    println!("Files:       {}", summary.files);
    println!("Directories: {}", summary.directories);
    println!("Documents:   {}", summary.documents);
    println!("Tests:       {}", summary.tests);
    println!("Excluded:    {}", summary.excluded);
    println!("Violations:  {}", summary.violations);

    if !summary.languages.is_empty() {
        println!();
        println!("{:<16}  {}", "LANGUAGE", "FILES");
        println!("{}", "-".repeat(24));
        for (language, count) in &summary.languages {
            println!("{language:<16}  {count}");
        }
    }

    if !summary.manifests.is_empty() {
        println!();
        println!("Manifests:");
        for manifest in &summary.manifests {
            println!("  {manifest}");
        }
    }

    if summary.violations > 0 {
        println!();
        println!("{:<40}  {:<24}  {}", "PATH", "CODE", "MESSAGE");
        println!("{}", "-".repeat(100));
        for (node, violation) in report.violations() {
            println!("{:<40}  {:<24}  {}", node.path, violation.code, violation.message);
        }
    }

    Ok(exit_codes::SUCCEEDED)
}

fn list_recipes(config: &Config) -> Result<i32, Box<dyn std::error::Error>> {
    let provider = FileConfigProvider::new(config.clone());
    let selector = RecipeSelector::new(
        provider.load_recipes()?,
        provider.load_rules()?,
        config.default_recipe.clone(),
    )?;

    println!("Recipes ({}):", selector.recipes().len());
    println!("{:<16}  {:<40}  {}", "NAME", "PHASES", "DESCRIPTION");
    println!("{}", "-".repeat(90));
    for recipe in selector.recipes() {
        let marker = if recipe.name == selector.default_recipe() {
            " (default)"
        } else {
            ""
        };
        println!(
            "{:<16}  {:<40}  {}{}",
            recipe.name,
            recipe.phase_names().join(" -> "),
            recipe.description,
            marker
        );
    }

    println!();
    println!("Rules (evaluation order):");
    for rule in selector.rules() {
        let signals: Vec<String> = rule.when.iter().map(|p| p.to_string()).collect();
        println!(
            "  {:<16}  keywords: [{}]  signals: [{}]",
            rule.recipe,
            rule.keywords.join(", "),
            signals.join(", ")
        );
    }
    Ok(exit_codes::SUCCEEDED)
}

fn list_agents(config: &Config) -> Result<i32, Box<dyn std::error::Error>> {
    let provider = FileConfigProvider::new(config.clone());
    let agents = provider.load_agents()?;

    println!("Agents ({}):", agents.len());
    println!(
        "{:<20}  {:<30}  {:<6}  {:<5}  {}",
        "ID", "CAPABILITIES", "COST", "SLOTS", "COMMAND"
    );
    println!("{}", "-".repeat(100));
    for agent in &agents {
        let capabilities: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<20}  {:<30}  {:<6}  {:<5}  {}",
            agent.id,
            capabilities.join(","),
            agent.cost,
            agent.max_concurrency,
            agent.command.join(" ")
        );
    }
    Ok(exit_codes::SUCCEEDED)
}

fn check_config(config: &Config) -> i32 {
    match Orchestrator::from_config(config) {
        Ok(orchestrator) => {
            println!(
                "Configuration OK: {} agents, {} recipes, default recipe '{}'",
                orchestrator.registry().len(),
                orchestrator.recipes().recipes().len(),
                orchestrator.recipes().default_recipe()
            );
            exit_codes::SUCCEEDED
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            e.exit_code()
        }
    }
}
