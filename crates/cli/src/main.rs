//! `workflow-orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — build the dependency graph of a workflow JSON file.
//! - `config`   — print the effective engine configuration.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{DependencyGraph, EngineConfig, Workflow};

#[derive(Parser)]
#[command(
    name = "workflow-orchestrator",
    about = "Dependency-aware workflow orchestration over a record store",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition and print its execution levels.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Print the graph as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print the configuration resolved from `WORKFLOW_*` variables.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path, json } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let workflow: Workflow =
                serde_json::from_str(&content).context("invalid workflow JSON")?;

            let graph = match DependencyGraph::for_workflow(&workflow) {
                Ok(graph) => graph,
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            };
            info!(steps = workflow.steps.len(), levels = graph.levels().len(), "workflow is valid");

            if json {
                println!("{}", serde_json::to_string_pretty(&describe(&graph))?);
            } else {
                print_graph(&workflow, &graph);
            }
        }
        Command::Config => {
            let config = EngineConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn print_graph(workflow: &Workflow, graph: &DependencyGraph) {
    println!("✅ Workflow is valid.");
    for (level, ids) in graph.levels().iter().enumerate() {
        println!("level {level}: {}", ids.join(", "));
    }
    for step in &workflow.steps {
        let declared = graph.declared_of(&step.id).cloned().unwrap_or_default();
        let detected = graph.detected_of(&step.id).cloned().unwrap_or_default();
        println!(
            "  {} ({}) declared={:?} detected={:?}",
            step.id, step.executor_ref, declared, detected
        );
    }
    for conflict in graph.conflicts() {
        println!(
            "⚠️  {}: declared {:?} but input references {:?}",
            conflict.step_id, conflict.declared, conflict.detected
        );
    }
}

fn describe(graph: &DependencyGraph) -> serde_json::Value {
    let steps: serde_json::Map<String, serde_json::Value> = graph
        .step_ids()
        .iter()
        .map(|id| {
            let entry = serde_json::json!({
                "declared": graph.declared_of(id),
                "detected": graph.detected_of(id),
                "dependencies": graph.dependencies_of(id),
            });
            (id.clone(), entry)
        })
        .collect();
    serde_json::json!({
        "levels": graph.levels(),
        "steps": steps,
        "conflicts": graph.conflicts(),
    })
}
