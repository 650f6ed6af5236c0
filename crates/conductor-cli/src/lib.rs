//! Command line interface for conductor.

pub mod progress;
pub mod workflow_file;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conductor_bus::{is_wildcard, topic_matches, Message, MessageBus, SubscribeOptions};
use conductor_config::Config;
use conductor_workflow::{
    DependencyGraph, LocalExecutor, WorkflowEngine, WorkflowEvent, WorkflowResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Log directive used with `--verbose`.
const VERBOSE_FILTER: &str =
    "info,conductor_bus=debug,conductor_workflow=debug,conductor_config=debug,conductor_cli=debug";

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about = "Agent coordination: message bus and workflow engine", long_about = None)]
pub struct Cli {
    /// Path to a configuration file (TOML or JSON)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging for conductor crates
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a workflow definition file
    Run {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check whether a topic pattern matches a topic
    Topic { pattern: String, topic: String },

    /// Print the effective configuration as TOML
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.log_level, cli.verbose)?;
    debug!("Effective configuration: {:?}", config);

    match cli.command {
        Command::Run { workflow, json } => run_workflow(&config, &workflow, json).await,
        Command::Topic { pattern, topic } => {
            println!("{}", describe_topic_match(&pattern, &topic));
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_logging(level: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))
    }
    .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

async fn run_workflow(config: &Config, path: &Path, json: bool) -> Result<()> {
    let workflow = workflow_file::load_workflow(path)?;
    info!(
        "Loaded workflow '{}' with {} tasks from {}",
        workflow.name,
        workflow.tasks.len(),
        path.display()
    );
    match DependencyGraph::new().execution_levels(&workflow.tasks) {
        Ok(levels) => {
            for (depth, level) in levels.iter().enumerate() {
                debug!("Level {}: {}", depth, level.join(", "));
            }
        }
        Err(e) => debug!("Tasks cannot be levelled: {}", e),
    }

    let bus = MessageBus::new(config.bus.clone());
    bus.subscribe(
        "workflow.**",
        |msg: Message| async move {
            let event: WorkflowEvent = msg.payload_as()?;
            debug!(topic = %msg.topic, "{:?}", event);
            Ok::<_, anyhow::Error>(())
        },
        SubscribeOptions::new(),
    )?;

    let executor = LocalExecutor::new(config.agents.clone());
    let engine = WorkflowEngine::with_config(Arc::new(executor), config.engine.clone());
    let forwarder = progress::forward_events(&engine, bus.clone());

    let result = engine.execute_workflow(workflow).await;
    engine.shutdown();
    drop(engine);
    forwarder.await.context("Event forwarder stopped unexpectedly")?;
    debug!("Bus stats: {:?}", bus.stats());
    bus.destroy();

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render_result(&result));
    }

    if !result.is_success() {
        bail!("Workflow {} {}", result.id, result.status);
    }
    Ok(())
}

/// One-line answer for the `topic` command.
pub fn describe_topic_match(pattern: &str, topic: &str) -> String {
    let verdict = if topic_matches(pattern, topic) {
        "matches"
    } else {
        "does not match"
    };
    let mut line = format!("{} {} {}", pattern, verdict, topic);
    if !is_wildcard(pattern) {
        line.push_str(" (no wildcards, exact comparison)");
    }
    line
}

/// Human-readable summary of a run.
pub fn render_result(result: &WorkflowResult) -> String {
    let mut out = format!(
        "Workflow {} {}: {} task(s) completed in {}ms\n",
        result.id, result.status, result.tasks_completed, result.duration_ms
    );
    if !result.execution_order.is_empty() {
        out.push_str(&format!("  order: {}\n", result.execution_order.join(" -> ")));
    }
    for error in &result.errors {
        out.push_str(&format!("  error: {}\n", error));
    }
    out
}
