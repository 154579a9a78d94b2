use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::core::TaskStatus;
use conductor::orchestration::{CommandWorker, QueryDecomposer, RunSummary, WorkerInvoker};
use conductor::shutdown::{self, ShutdownGuard};
use conductor::{clog, clog_error, Result, Runtime};

/// Conductor - dependency-aware multi-agent task runner
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Repository to work in (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Override the configured concurrency ceiling
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a request, then execute every task
    Run {
        /// The request in natural language
        request: String,
    },

    /// Print the execution graph for a request without running it
    Plan {
        request: String,
    },

    /// Show task and agent counts from the store
    Status,

    /// Recover from a previous run and drain pending tasks
    Resume,

    /// Remove workspaces and branches left behind by earlier runs
    Cleanup,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);
    clog!("Conductor starting: {:?}", cli.command);

    let mut config = Config::load()?;
    if let Some(n) = cli.concurrency {
        config.max_concurrency = n;
    }
    let repo_path = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Command::Plan { request } => run_plan(&config, &request),
        Command::Status => run_status(config, &repo_path),
        Command::Cleanup => run_cleanup(config, &repo_path),
        Command::Run { request } => run_guarded(config, &repo_path, Some(request)),
        Command::Resume => run_guarded(config, &repo_path, None),
    }
}

fn run_plan(config: &Config, request: &str) -> Result<()> {
    let graph = QueryDecomposer::new(config.effective_concurrency()).decompose(request)?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(())
}

/// Runtime for commands that never invoke a worker.
fn open_passive(config: Config, repo_path: &Path) -> Result<Runtime> {
    let invoker = CommandWorker::with_binary(PathBuf::from(config.effective_command()));
    Runtime::open(config, repo_path, Arc::new(invoker))
}

fn run_status(config: Config, repo_path: &Path) -> Result<()> {
    let runtime = open_passive(config, repo_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(runtime.status())?;

    println!("Tasks: {}", report.total_tasks());
    for status in TaskStatus::ALL {
        println!("  {:<12} {}", status.as_str(), report.task_count(status));
    }
    println!("Agents:");
    if report.agents.is_empty() {
        println!("  (none)");
    }
    for count in &report.agents {
        println!("  {:<24} {:<8} {}", count.agent_type, count.status.as_str(), count.count);
    }
    match report.mean_completed_duration_ms {
        Some(ms) => println!("Mean completed duration: {:.1}s", ms / 1000.0),
        None => println!("Mean completed duration: n/a"),
    }
    Ok(())
}

fn run_cleanup(config: Config, repo_path: &Path) -> Result<()> {
    let runtime = open_passive(config, repo_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let swept = rt.block_on(runtime.cleanup_workspaces())?;
    println!("Removed {} workspace(s)", swept);
    Ok(())
}

/// Run or resume with the shutdown guard watching OS signals.
fn run_guarded(config: Config, repo_path: &Path, request: Option<String>) -> Result<()> {
    let invoker: Arc<dyn WorkerInvoker> = Arc::new(CommandWorker::new(config.effective_command())?);
    let runtime = Arc::new(Runtime::open(config, repo_path, invoker)?);
    shutdown::install_panic_hook(runtime.hooks());
    let guard = Arc::new(runtime.shutdown_guard());

    let rt = tokio::runtime::Runtime::new()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    rt.spawn(async move {
        if let Err(e) = shutdown::forward_os_signals(tx).await {
            clog_error!("Signal forwarding stopped: {}", e);
        }
    });
    let watcher = Arc::clone(&guard);
    std::thread::spawn(move || {
        let code = watcher.run(&rx);
        clog!("Exiting with code {}", code);
        std::process::exit(code);
    });

    let outcome = rt.block_on(async {
        runtime.cleanup_workspaces().await?;
        match request {
            Some(request) => {
                let (graph, summary) = runtime.run_request(&request).await?;
                println!(
                    "{} ({}, {}): {} task(s)",
                    graph.request,
                    graph.intent,
                    graph.complexity,
                    graph.nodes.len()
                );
                Ok::<_, conductor::Error>(summary)
            }
            None => {
                let (recovery, summary) = runtime.resume().await?;
                println!(
                    "Recovered {} task(s), {} interrupted",
                    recovery.tasks_loaded,
                    recovery.interrupted.len()
                );
                Ok::<_, conductor::Error>(summary)
            }
        }
    });

    match outcome {
        Ok(summary) => {
            print_summary(&summary);
            runtime.shutdown()
        }
        Err(e) => exit_emergency(&guard, &e),
    }
}

fn exit_emergency(guard: &ShutdownGuard, error: &conductor::Error) -> ! {
    eprintln!("Error: {}", error);
    std::process::exit(guard.emergency(&error.to_string()));
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.reports {
        match &report.error {
            Some(error) => println!(
                "  [{}] {} ({}): {}",
                report.status, report.task_id, report.agent_type, error
            ),
            None => println!("  [{}] {} ({})", report.status, report.task_id, report.agent_type),
        }
    }
    println!(
        "{} completed, {} failed",
        summary.count(TaskStatus::Completed),
        summary.count(TaskStatus::Failed)
    );
}
