//! Stepflow CLI
//!
//! Usage:
//!   stepflow list
//!   stepflow show review
//!   stepflow validate
//!   stepflow run review --arg focus=security --hitl auto
//!   stepflow resume .stepflow/runs/review/<run_id>/state.json --accept

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepflow::config::StepflowConfig;
use stepflow::hitl::{
    AutoAcceptHitlHandler, HitlHandler, HitlResult, InteractiveHitlHandler, RejectHitlHandler,
    SuspendHitlHandler,
};
use stepflow::workflow::StepKind;
use stepflow::{Executor, OllamaAgent, RunOutcome, Validator, WorkflowLoader, WorkflowRegistry};

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Run declarative multi-step workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ollama server URL
    #[arg(long, env = "OLLAMA_URL", global = true)]
    ollama_url: Option<String>,

    /// Model to use for agent steps
    #[arg(short = 'm', long, env = "OLLAMA_MODEL", global = true)]
    model: Option<String>,

    /// Extra workflow directories (searched after the project directory)
    #[arg(long = "workflows-dir", global = true)]
    workflows_dirs: Vec<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace). Default is warn.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List available workflows
    List,
    /// Show a workflow definition
    Show {
        /// Workflow name
        workflow: String,
    },
    /// Validate one workflow, or all of them
    Validate {
        /// Workflow name
        workflow: Option<String>,
    },
    /// Run a workflow
    Run {
        /// Workflow name
        workflow: String,

        /// Input value as key=value (repeatable)
        #[arg(long = "arg", short = 'a', value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// How review gates are answered
        #[arg(long, value_enum, default_value_t = HitlMode::Interactive)]
        hitl: HitlMode,
    },
    /// Resume a suspended or interrupted run
    Resume {
        /// Path to the run's state.json
        state: PathBuf,

        /// Accept the pending output
        #[arg(long, conflicts_with_all = ["reject", "edit"])]
        accept: bool,

        /// Reject the pending output
        #[arg(long, conflicts_with = "edit")]
        reject: bool,

        /// Replace the pending output with this JSON object
        #[arg(long)]
        edit: Option<String>,

        /// How later review gates are answered
        #[arg(long, value_enum, default_value_t = HitlMode::Interactive)]
        hitl: HitlMode,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HitlMode {
    Interactive,
    Auto,
    Reject,
    Suspend,
}

impl HitlMode {
    fn handler(self) -> Arc<dyn HitlHandler> {
        match self {
            HitlMode::Interactive => Arc::new(InteractiveHitlHandler),
            HitlMode::Auto => Arc::new(AutoAcceptHitlHandler),
            HitlMode::Reject => Arc::new(RejectHitlHandler),
            HitlMode::Suspend => Arc::new(SuspendHitlHandler),
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Initialize tracing with the given verbosity level
///
/// - 0: warn (default)
/// - 1: info (-v)
/// - 2: debug (-vv)
/// - 3+: trace (-vvv)
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // RUST_LOG wins when set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cwd = std::env::current_dir()?;
    let config = StepflowConfig::load_from_dir(&cwd)?;

    let mut loader = WorkflowLoader::new(&cwd);
    for dir in cli.workflows_dirs.iter().chain(config.workflows.dirs.iter()) {
        loader = loader.with_dir(dir);
    }
    let registry = Arc::new(loader.discover());

    match cli.command {
        Commands::List => list(&registry),
        Commands::Show { workflow } => show(&registry, &workflow),
        Commands::Validate { workflow } => validate(&registry, workflow.as_deref()),
        Commands::Run {
            workflow,
            args,
            hitl,
        } => {
            let executor = build_executor(cli.ollama_url, cli.model, config, registry, &cwd, hitl);

            let args: Map<String, Value> = args
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let outcome = executor.run(&workflow, args).await?;
            report(&outcome)
        }
        Commands::Resume {
            state,
            accept,
            reject,
            edit,
            hitl,
        } => {
            let decision = if accept {
                Some(HitlResult::Accept)
            } else if reject {
                Some(HitlResult::Reject)
            } else if let Some(edit) = edit {
                let value: Value = serde_json::from_str(&edit).context("--edit must be valid JSON")?;
                match value {
                    Value::Object(map) => Some(HitlResult::Edit(map)),
                    _ => bail!("--edit must be a JSON object"),
                }
            } else {
                None
            };

            let executor = build_executor(cli.ollama_url, cli.model, config, registry, &cwd, hitl);
            let outcome = executor.resume(&state, decision).await?;
            report(&outcome)
        }
    }
}

/// Wire the Ollama agent and engine settings into an executor; CLI flags win
/// over the config file
fn build_executor(
    url: Option<String>,
    model: Option<String>,
    config: StepflowConfig,
    registry: Arc<WorkflowRegistry>,
    cwd: &Path,
    hitl: HitlMode,
) -> Executor {
    let url = url.unwrap_or(config.agent.url);
    let model = model.unwrap_or(config.agent.model);
    let agent = OllamaAgent::new(&url, &model).with_system_prompt(config.agent.system_prompt);
    Executor::new(registry, Arc::new(agent))
        .with_config(config.engine)
        .with_workdir(cwd)
        .with_hitl_handler(hitl.handler())
}

fn list(registry: &WorkflowRegistry) -> Result<()> {
    println!("Available Workflows:\n");
    for workflow in registry.iter() {
        if workflow.description.is_empty() {
            println!("  {} ({})", workflow.name, workflow.source);
        } else {
            println!("  {} - {} ({})", workflow.name, workflow.description, workflow.source);
        }
    }
    println!("\nRun a workflow with: stepflow run <name> --arg key=value");
    Ok(())
}

fn show(registry: &WorkflowRegistry, name: &str) -> Result<()> {
    let Some(wf) = registry.get(name) else {
        eprintln!("Workflow '{}' not found.", name);
        eprintln!("Use 'stepflow list' to see available workflows.");
        std::process::exit(1);
    };

    println!("Workflow: {}\n", wf.name);
    if !wf.description.is_empty() {
        println!("Description: {}\n", wf.description);
    }
    println!("Source: {}\n", wf.source);

    if !wf.inputs.is_empty() {
        println!("Inputs:");
        for input in &wf.inputs {
            match &input.default {
                Some(default) => println!("  {} ({:?}, default {})", input.name, input.ty, default),
                None => println!("  {} ({:?}, required)", input.name, input.ty),
            }
        }
        println!();
    }

    println!("Steps:");
    for (i, step) in wf.steps.iter().enumerate() {
        let mut flags = Vec::new();
        if let Some(cond) = &step.condition {
            flags.push(format!("if {}", cond));
        }
        if let Some(looping) = &step.looping {
            flags.push(looping.keyword().to_string());
        }
        if step.hitl {
            flags.push("hitl".to_string());
        }
        if step.hidden {
            flags.push("hidden".to_string());
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        };

        println!("  {}. [{}: {}]{}", i + 1, step.step_type(), step.name, flags);
        if let StepKind::Parallel { steps } = &step.kind {
            for member in steps {
                println!("     - [{}: {}]", member.step_type(), member.name);
            }
        }
    }
    Ok(())
}

fn validate(registry: &WorkflowRegistry, name: Option<&str>) -> Result<()> {
    let workflows = match name {
        Some(name) => match registry.get(name) {
            Some(wf) => vec![wf],
            None => bail!("Workflow '{}' not found", name),
        },
        None => registry.iter().cloned().collect(),
    };

    let validator = Validator::new(registry);
    let mut failed = 0;
    for wf in &workflows {
        match validator.validate(wf) {
            Ok(()) => println!("ok      {}", wf.name),
            Err(e) => {
                failed += 1;
                println!("invalid {}", e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} workflow(s) failed validation", failed, workflows.len());
    }
    Ok(())
}

fn report(outcome: &RunOutcome) -> Result<()> {
    let state = outcome.state();
    println!("\nRun: {}", state.run_id);
    println!("Workflow Status: {:?}", state.status);

    let summary = state.summary();
    let mut counts: Vec<_> = summary.iter().collect();
    counts.sort_by_key(|(status, _)| status.to_string());
    for (status, count) in counts {
        println!("  {}: {}", status, count);
    }

    match outcome {
        RunOutcome::Completed(_) => Ok(()),
        RunOutcome::Suspended(state) => {
            println!(
                "\nWaiting for review. Resume with: stepflow resume {} --accept",
                state.state_path().display()
            );
            Ok(())
        }
        RunOutcome::Rejected(state) => {
            bail!(
                "step '{}' was rejected",
                state.rejected_step.as_deref().unwrap_or("?")
            )
        }
    }
}
