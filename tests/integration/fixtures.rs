//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories on a `main` branch
//! - Mock worker invokers with controllable timing and side effects
//! - Wiring a `Runtime` around an in-memory store

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::mpsc;

use conductor::config::Config;
use conductor::core::Task;
use conductor::orchestration::{PoolEvent, WorkerInvoker, WorkerOutput};
use conductor::store::Database;
use conductor::{Error, Result, Runtime};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a repository with one commit on `main`.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        git(&path, &["init"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Directory next to the repo for worktrees.
    pub fn worktree_root(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    pub fn main_head(&self) -> String {
        git(&self.path, &["rev-parse", "main"])
    }

    /// Files tracked on `main`.
    pub fn files_on_main(&self) -> Vec<String> {
        git(&self.path, &["ls-tree", "-r", "--name-only", "main"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        git(&self.path, &["rev-list", "--count", "main"])
            .parse()
            .expect("rev-list count")
    }

    pub fn branches(&self) -> Vec<String> {
        git(&self.path, &["branch", "--format=%(refname:short)"])
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Run git in `dir` and return trimmed stdout, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Config pointing every path at the test repo's temp dir.
pub fn test_config(repo: &TestRepo, max_concurrency: usize, timeout_secs: u64) -> Config {
    Config {
        max_concurrency,
        task_timeout_secs: timeout_secs,
        worktree_dir: Some(repo.worktree_root().to_string_lossy().into_owned()),
        ..Config::default()
    }
}

/// A runtime over an in-memory store plus its event stream.
pub struct Harness {
    pub repo: TestRepo,
    pub runtime: Runtime,
    pub events: Mutex<mpsc::UnboundedReceiver<PoolEvent>>,
}

impl Harness {
    pub fn new(invoker: Arc<dyn WorkerInvoker>, max_concurrency: usize, timeout_secs: u64) -> Self {
        let repo = TestRepo::new();
        let config = test_config(&repo, max_concurrency, timeout_secs);
        let db = Arc::new(Database::open_in_memory().expect("in-memory database"));
        let (tx, events) = mpsc::unbounded_channel();
        let runtime =
            Runtime::build(config, &repo.path, db, invoker, Some(tx)).expect("runtime builds");
        Self {
            repo,
            runtime,
            events: Mutex::new(events),
        }
    }

    /// Everything emitted so far.
    pub fn drain_events(&self) -> Vec<PoolEvent> {
        let mut rx = self.events.lock().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn enqueue(&self, tasks: &[Task]) {
        self.runtime
            .coordinator()
            .enqueue_graph(tasks)
            .expect("enqueue succeeds");
    }
}

/// Name of the workspace directory, unique per task.
fn workspace_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string())
}

/// Succeeds immediately without touching the workspace.
pub struct EchoWorker;

impl WorkerInvoker for EchoWorker {
    fn invoke(&self, instruction: String, _workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        Box::pin(async move {
            let first = instruction.lines().next().unwrap_or_default().to_string();
            Ok(WorkerOutput::text(format!("done: {}", first)))
        })
    }
}

/// Writes `<workspace name>.txt` into the workspace.
pub struct FileWorker;

impl WorkerInvoker for FileWorker {
    fn invoke(&self, _instruction: String, workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        Box::pin(async move {
            let name = format!("{}.txt", workspace_name(&workspace));
            tokio::fs::write(workspace.join(&name), "generated\n").await?;
            Ok(WorkerOutput::text(format!("wrote {}", name)))
        })
    }
}

/// Every task rewrites the same file with different content.
pub struct ConflictWorker;

impl WorkerInvoker for ConflictWorker {
    fn invoke(&self, _instruction: String, workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        Box::pin(async move {
            let content = format!("written by {}\n", workspace_name(&workspace));
            tokio::fs::write(workspace.join("README.md"), content).await?;
            Ok(WorkerOutput::text("edited README"))
        })
    }
}

pub struct FailingWorker;

impl WorkerInvoker for FailingWorker {
    fn invoke(&self, _instruction: String, _workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        Box::pin(async { Err(Error::Worker("boom".to_string())) })
    }
}

/// Sleeps for `slow` when the instruction mentions `marker`, otherwise
/// succeeds at once.
pub struct SelectiveWorker {
    pub marker: &'static str,
    pub slow: Duration,
}

impl WorkerInvoker for SelectiveWorker {
    fn invoke(&self, instruction: String, _workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        let delay = if instruction.contains(self.marker) {
            Some(self.slow)
        } else {
            None
        };
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(WorkerOutput::text("finished"))
        })
    }
}

/// Records how many invocations overlap.
#[derive(Default)]
pub struct TrackingWorker {
    pub delay: Duration,
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub calls: Arc<AtomicUsize>,
}

impl TrackingWorker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

impl WorkerInvoker for TrackingWorker {
    fn invoke(&self, _instruction: String, _workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        let current = Arc::clone(&self.current);
        let peak = Arc::clone(&self.peak);
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(WorkerOutput::text("tracked"))
        })
    }
}

/// Independent tasks `t0..tn` routed to the researcher type.
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            Task::new(&format!("Job {}", i), "Investigate the module", "researcher")
                .with_id(format!("t{}", i))
        })
        .collect()
}
