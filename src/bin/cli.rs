use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use persona_workflows::prelude::*;
use persona_workflows::{StepStatus, TracingSink, WorkflowType};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "persona-workflows")]
#[command(about = "Run persona DevOps workflows from YAML definitions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workflows directory (default: workflows_dir from engine.yaml)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Path to engine.yaml (default: ./engine.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a registered workflow
    Run {
        /// Workflow id
        #[arg(value_name = "ID")]
        id: String,

        /// Input as KEY=VALUE; repeatable
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List registered workflows
    List {
        /// Only workflows of this type (master, core, support, utility)
        #[arg(short = 't', long = "type")]
        workflow_type: Option<WorkflowType>,

        /// Only workflows carrying this tag; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Search workflows by id, name, description or tag
    Search {
        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// Validate a workflow file or every file in a directory
    Validate {
        /// Path to workflow file or directory
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Show the workflows a workflow depends on
    Deps {
        #[arg(value_name = "ID")]
        id: String,

        /// Follow dependencies transitively
        #[arg(short, long)]
        recursive: bool,
    },

    /// Write the registry index as JSON
    Export {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "persona_workflows=debug"
    } else {
        "persona_workflows=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = load_config(cli.config.as_deref())?;
    let dir = cli.dir.unwrap_or_else(|| config.workflows_dir.clone());

    match cli.command {
        Commands::Run { id, inputs, json } => {
            run_workflow(&dir, config, &id, &inputs, json, cli.verbose).await
        }
        Commands::List {
            workflow_type,
            tags,
        } => list_workflows(&dir, WorkflowFilter { workflow_type, tags }),
        Commands::Search { text } => search_workflows(&dir, &text),
        Commands::Validate { path } => validate(&path),
        Commands::Deps { id, recursive } => show_dependencies(&dir, &id, recursive),
        Commands::Export { file } => export_index(&dir, &file),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(EngineConfig::load_from_dir(Path::new("."))?),
    }
}

fn open_registry(dir: &Path) -> anyhow::Result<Arc<WorkflowRegistry>> {
    if !dir.exists() {
        anyhow::bail!("Directory not found: {}", dir.display());
    }

    let registry = WorkflowRegistry::new(dir);
    let report = registry.scan()?;
    for failure in &report.failures {
        tracing::warn!("Skipped {}: {}", failure.path.display(), failure.error);
    }
    Ok(Arc::new(registry))
}

/// `KEY=VALUE` pairs; values that parse as JSON keep their type
fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid input '{}', expected KEY=VALUE", pair))?;
        if key.is_empty() {
            anyhow::bail!("Invalid input '{}', key is empty", pair);
        }
        let value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

async fn run_workflow(
    dir: &Path,
    config: EngineConfig,
    id: &str,
    pairs: &[String],
    json: bool,
    verbose: bool,
) -> anyhow::Result<bool> {
    let inputs = parse_inputs(pairs)?;
    let registry = open_registry(dir)?;

    let mut executor = Executor::from_config(registry, config)?;
    if verbose {
        executor = executor.with_history_sink(Arc::new(TracingSink));
    }

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let result = executor.run_with_cancel(id, inputs, token).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_run_result(&result);
    }

    Ok(result.is_success())
}

fn list_workflows(dir: &Path, filter: WorkflowFilter) -> anyhow::Result<bool> {
    let registry = open_registry(dir)?;
    let workflows = registry.list(&filter);

    if workflows.is_empty() {
        println!("No workflows found in: {}", dir.display());
        return Ok(true);
    }

    println!("Workflows in {}:\n", dir.display());
    for w in &workflows {
        let tags = if w.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", w.tags.join(", "))
        };
        println!(
            "  {} v{} ({}) - {}{}",
            w.id, w.version, w.workflow_type, w.name, tags
        );
    }

    Ok(true)
}

fn search_workflows(dir: &Path, text: &str) -> anyhow::Result<bool> {
    let registry = open_registry(dir)?;
    let found = registry.search(text);

    if found.is_empty() {
        println!("No workflows match '{}'", text);
        return Ok(true);
    }
    for w in &found {
        println!("  {} - {}", w.id, w.description);
    }
    Ok(true)
}

fn validate(path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        anyhow::bail!("Path not found: {}", path.display());
    }

    if !path.is_dir() {
        return match WorkflowLoader::load_file(path) {
            Ok(definition) => {
                println!("✓ {} is valid ({})", path.display(), definition.id());
                Ok(true)
            }
            Err(e) => {
                println!("✗ {}", path.display());
                print_definition_error(&e);
                Ok(false)
            }
        };
    }

    let registry = WorkflowRegistry::new(path);
    let report = registry.scan()?;
    for failure in &report.failures {
        println!("✗ {}: {}", failure.path.display(), failure.error);
    }

    let dangling: Vec<(String, String)> = registry
        .list(&WorkflowFilter::default())
        .into_iter()
        .flat_map(|w| {
            w.dependencies
                .into_iter()
                .filter(|dep| !registry.contains(dep))
                .map(move |dep| (w.id.clone(), dep))
        })
        .collect();
    for (id, dep) in &dangling {
        println!("! {} references unknown workflow '{}'", id, dep);
    }

    println!(
        "{} workflows validated, {} failures",
        report.indexed,
        report.failures.len()
    );
    Ok(report.failures.is_empty())
}

fn print_definition_error(error: &persona_workflows::DefinitionError) {
    let violations = error.violations();
    if violations.is_empty() {
        println!("    {}", error);
    }
    for violation in violations {
        println!("    {}", violation);
    }
}

fn show_dependencies(dir: &Path, id: &str, recursive: bool) -> anyhow::Result<bool> {
    let registry = open_registry(dir)?;
    let deps = registry.dependencies(id, recursive)?;

    if deps.is_empty() {
        println!("{} has no dependencies", id);
    } else {
        println!("{} depends on:", id);
        for dep in &deps {
            let marker = if registry.contains(dep) { " " } else { "!" };
            println!("  {} {}", marker, dep);
        }
    }

    let dependents = registry.dependents(id);
    if !dependents.is_empty() {
        println!("Used by: {}", dependents.join(", "));
    }
    Ok(true)
}

fn export_index(dir: &Path, file: &Path) -> anyhow::Result<bool> {
    let registry = open_registry(dir)?;
    registry.export(file)?;
    let stats = registry.stats();
    println!("Exported {} workflows to {}", stats.total, file.display());
    Ok(true)
}

fn print_run_result(result: &RunResult) {
    println!("\n=== Workflow Result ===\n");
    println!("Workflow: {}", result.workflow_id);
    println!("Status: {}", result.status);
    println!("Run ID: {}\n", result.run_id);

    for entry in &result.history {
        let marker = match entry.status {
            StepStatus::Succeeded => "✓",
            StepStatus::Skipped => "-",
            _ => "✗",
        };
        let attempt = if entry.attempt > 1 {
            format!(" (attempt {})", entry.attempt)
        } else {
            String::new()
        };
        println!("{} {} [{}]{}", marker, entry.step_id, entry.action, attempt);
        if let Some(err) = &entry.error {
            println!("      Error: {}", err.message);
        }
    }

    if !result.outputs.is_empty() {
        println!("\nOutputs:");
        for (name, value) in &result.outputs {
            println!("  {} = {}", name, value);
        }
    }
    for error in &result.output_errors {
        println!("  ! {}", error);
    }

    for report in &result.criteria {
        println!("Criterion '{}': {:?}", report.description, report.outcome);
    }

    let summary = result.summary();
    println!(
        "\n{} executed ({} succeeded, {} failed), {} skipped, {} retries",
        summary.executed, summary.succeeded, summary.failed, summary.skipped, summary.retries
    );
}
