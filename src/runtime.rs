//! Runtime context: every component constructed once from `Config` and
//! passed where it is needed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::orchestration::{
    Coordinator, ExecutionGraph, PoolEvent, PoolOptions, QueryDecomposer, Recovery, RunSummary,
    StatusReport, WorkerInvoker, WorkerPool,
};
use crate::registry::AgentRegistry;
use crate::shutdown::{ShutdownGuard, ShutdownHooks};
use crate::store::Database;
use crate::util::blocking;
use crate::workspace::WorkspaceIsolator;
use crate::{clog, clog_debug, clog_warn, Result};

/// How long the emergency save may take before the process exits anyway.
const EMERGENCY_SAVE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Runtime {
    config: Config,
    coordinator: Arc<Coordinator>,
    registry: Arc<AgentRegistry>,
    isolator: Arc<WorkspaceIsolator>,
    decomposer: QueryDecomposer,
    pool: Arc<WorkerPool>,
}

impl Runtime {
    /// Open the configured database and wire everything for the repository
    /// at `repo_path`.
    pub fn open(config: Config, repo_path: &Path, invoker: Arc<dyn WorkerInvoker>) -> Result<Self> {
        config.ensure_dirs()?;
        let db = Database::open(&config.database_file()?)?;
        Self::build(config, repo_path, Arc::new(db), invoker, None)
    }

    /// Wire a runtime around an existing database.
    ///
    /// Workspaces live under `<worktrees_dir>/<repo name>`.
    pub fn build(
        config: Config,
        repo_path: &Path,
        db: Arc<Database>,
        invoker: Arc<dyn WorkerInvoker>,
        events: Option<tokio::sync::mpsc::UnboundedSender<PoolEvent>>,
    ) -> Result<Self> {
        let registry = Arc::new(AgentRegistry::from_config(&config)?);
        let repo_name = repo_path
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "repo".to_string());
        let isolator = Arc::new(WorkspaceIsolator::new(
            repo_path,
            &config.worktrees_dir()?.join(repo_name),
            config.main_branch.as_deref(),
            &config.branch_prefix,
        )?);
        let coordinator = Arc::new(Coordinator::new(db));

        let options = PoolOptions {
            max_concurrency: config.effective_concurrency(),
            task_timeout: config.task_timeout(),
            fallback: config.fallback.clone(),
        };
        let mut pool = WorkerPool::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            Arc::clone(&isolator),
            invoker,
            options,
        );
        if let Some(events) = events {
            pool = pool.with_events(events);
        }

        clog_debug!(
            "Runtime::build agents={} concurrency={} main={}",
            registry.len(),
            config.effective_concurrency(),
            isolator.main_branch()
        );
        Ok(Self {
            decomposer: QueryDecomposer::new(config.effective_concurrency()),
            config,
            coordinator,
            registry,
            isolator,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn isolator(&self) -> &Arc<WorkspaceIsolator> {
        &self.isolator
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn plan(&self, request: &str) -> Result<ExecutionGraph> {
        self.decomposer.decompose(request)
    }

    /// Decompose, persist and execute one request.
    pub async fn run_request(&self, request: &str) -> Result<(ExecutionGraph, RunSummary)> {
        let graph = self.plan(request)?;
        clog!(
            "Request decomposed: intent={} complexity={} tasks={}",
            graph.intent,
            graph.complexity,
            graph.nodes.len()
        );

        let coordinator = Arc::clone(&self.coordinator);
        let nodes = graph.nodes.clone();
        blocking(move || coordinator.enqueue_graph(&nodes)).await?;

        let summary = self.pool.execute_tasks_with_agents(&graph.nodes).await?;
        Ok((graph, summary))
    }

    /// Recover after a restart and drain whatever is still pending.
    pub async fn resume(&self) -> Result<(Recovery, RunSummary)> {
        let coordinator = Arc::clone(&self.coordinator);
        let recovery = blocking(move || coordinator.load_from_database()).await?;
        if !recovery.interrupted.is_empty() {
            clog_warn!("{} task(s) were interrupted by the previous run", recovery.interrupted.len());
        }
        self.cleanup_workspaces().await?;
        let summary = self.pool.run_pending().await?;
        Ok((recovery, summary))
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let coordinator = Arc::clone(&self.coordinator);
        blocking(move || coordinator.get_status()).await
    }

    /// Sweep workspaces left behind by a crashed run.
    pub async fn cleanup_workspaces(&self) -> Result<usize> {
        let isolator = Arc::clone(&self.isolator);
        blocking(move || Ok(isolator.cleanup_all())).await
    }

    /// Stop the pool and take every agent offline.
    pub fn shutdown(&self) -> Result<()> {
        self.pool.shutdown();
        self.coordinator.cleanup()
    }

    pub fn hooks(&self) -> Arc<dyn ShutdownHooks> {
        Arc::new(RuntimeHooks {
            coordinator: Arc::clone(&self.coordinator),
            pool: Arc::clone(&self.pool),
        })
    }

    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard::new(self.pool.clone(), self.hooks())
    }
}

struct RuntimeHooks {
    coordinator: Arc<Coordinator>,
    pool: Arc<WorkerPool>,
}

impl ShutdownHooks for RuntimeHooks {
    fn save_state(&self) -> Result<()> {
        self.coordinator.cleanup()
    }

    fn stop_executions(&self) {
        self.pool.shutdown();
    }

    fn emergency_save(&self) {
        // the panicking thread may hold the store lock, so save elsewhere
        let (tx, rx) = crossbeam_channel::bounded(1);
        let coordinator = Arc::clone(&self.coordinator);
        std::thread::spawn(move || {
            let _ = tx.send(coordinator.cleanup());
        });
        match rx.recv_timeout(EMERGENCY_SAVE_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => clog_warn!("Emergency save failed: {}", e),
            Err(_) => clog_warn!("Emergency save did not finish in {:?}", EMERGENCY_SAVE_TIMEOUT),
        }
    }
}
