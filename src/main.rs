use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use lanes::config::Config;
use lanes::core::TaskGraph;
use lanes::orchestration::{
    CommandModel, DryRunExecutor, EventSink, Orchestrator, OrchestratorEvent, RunResult,
};
use lanes::{llog, Error, Result};

/// Lanes - parallel orchestration of model-driven workers
#[derive(Parser, Debug)]
#[command(name = "lanes")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    LANES_DEBUG=1        Enable debug logging (alternative to --debug)\n    LANES_LOG=<level>    error, warn, info, debug or trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.lanes/lanes.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.lanes/lanes.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a goal and run it across parallel lanes
    Run {
        /// The goal in natural language
        goal: String,

        /// Run a pre-built task graph (JSON) instead of calling the planner
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Suppress progress lines on stderr
        #[arg(short = 'q', long)]
        quiet: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write the defaults to the config path if no file exists yet
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    lanes::log::init(cli.debug);
    if cli.debug {
        if let Some(path) = lanes::log::path() {
            eprintln!("  log: {}", path.display());
        }
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    match cli.command {
        Command::Run { goal, graph, quiet } => run(&config_path, goal, graph, quiet),
        Command::Config { init } => show_config(&config_path, init),
    }
}

fn run(config_path: &Path, goal: String, graph: Option<PathBuf>, quiet: bool) -> Result<()> {
    let config = Config::load_from(config_path)?;
    llog!("Run command: goal={:?}, graph={:?}", goal, graph);

    let cwd = std::env::current_dir()?;
    let model = Arc::new(CommandModel::new(config.models.effective_command(), &cwd)?);
    let executor = Arc::new(DryRunExecutor::new());

    let graph = match graph {
        Some(path) => Some(TaskGraph::from_json(&goal, &std::fs::read_to_string(path)?)?),
        None => None,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let (events, mut rx) = EventSink::channel();
        let orchestrator = Orchestrator::new(config, model, executor).with_events(events);

        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !quiet {
                    print_event(&event);
                }
            }
        });

        let result = match graph {
            Some(graph) => orchestrator.run_graph(graph).await,
            None => orchestrator.run(&goal).await,
        };
        // Dropping the orchestrator closes the channel and ends the printer.
        drop(orchestrator);
        printer
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        result
    })?;

    if !quiet {
        print_summary(&result);
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::GraphCreated {
            nodes, fallback, ..
        } => {
            let note = if *fallback { " (planner fallback)" } else { "" };
            eprintln!("  graph: {} nodes{}", nodes, note);
        }
        OrchestratorEvent::LaneStatusChanged {
            lane_id,
            to,
            reason,
            ..
        } => eprintln!("  {} -> {} ({})", lane_id, to, reason),
        OrchestratorEvent::MergeConflict {
            lane_id,
            conflicting_lane,
            region,
        } => eprintln!("  conflict: {} vs {} on {}", lane_id, conflicting_lane, region),
        OrchestratorEvent::BudgetWarning { ratio, .. } => {
            eprintln!("  budget: {:.0}% used", ratio * 100.0)
        }
        OrchestratorEvent::RunError { message } => eprintln!("  error: {}", message),
        _ => {}
    }
}

fn print_summary(result: &RunResult) {
    eprintln!();
    eprintln!("  Run:     {}", result.run_id.short());
    eprintln!("  Status:  {}", if result.success { "complete" } else { "incomplete" });
    eprintln!("  Summary: {}", result.summary);
    for node in &result.nodes {
        eprintln!("    {:<16} {}", node.id.as_str(), node.status);
    }
    eprintln!();
}

fn show_config(path: &Path, init: bool) -> Result<()> {
    let config = Config::load_from(path)?;
    if init && !path.exists() {
        config.save_to(path)?;
        println!("# written to {}", path.display());
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
