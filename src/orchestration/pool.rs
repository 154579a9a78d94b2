//! Bounded-concurrency worker pool.
//!
//! The pool runs a task batch level by level. Every task in a level is
//! launched at once and waits for one of `max_concurrency` semaphore slots.
//! Each task runs in its own workspace under a deadline; its outcome always
//! goes back through the `Coordinator`, so a failure or timeout never aborts
//! its siblings.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::FallbackPolicy;
use crate::core::{Agent, AgentId, Completion, Complexity, Task, TaskDAG, TaskId, TaskStatus};
use crate::orchestration::coordinator::Coordinator;
use crate::orchestration::matcher::AgentMatcher;
use crate::orchestration::worker::{WorkerInvoker, WorkerOutput};
use crate::registry::AgentRegistry;
use crate::util::{blocking, blocking_with_timeout};
use crate::workspace::{Workspace, WorkspaceIsolator};
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Upper bound on creating or merging a workspace.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle notifications, sent when a channel is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    LevelStarted { level: usize, tasks: usize },
    TaskStarted { task_id: TaskId, agent_id: AgentId, agent_type: String },
    TaskFinished { task_id: TaskId, status: TaskStatus },
    TaskSkipped { task_id: TaskId, reason: String },
}

/// Final state of one task after a pool run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub agent_type: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

impl TaskReport {
    fn new(task_id: &TaskId, agent_type: &str, status: TaskStatus, error: Option<String>) -> Self {
        Self {
            task_id: task_id.clone(),
            agent_type: agent_type.to_string(),
            status,
            error,
        }
    }
}

/// Summary of a pool run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub reports: Vec<TaskReport>,
}

impl RunSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    pub fn report(&self, task_id: &TaskId) -> Option<&TaskReport> {
        self.reports.iter().find(|r| &r.task_id == task_id)
    }

    pub fn all_completed(&self) -> bool {
        self.reports.iter().all(|r| r.status == TaskStatus::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_concurrency: usize,
    pub task_timeout: Duration,
    pub fallback: FallbackPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_concurrency: crate::config::DEFAULT_MAX_CONCURRENCY,
            task_timeout: Duration::from_secs(crate::config::DEFAULT_TASK_TIMEOUT_SECS),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Decrements the in-flight counter when a task leaves its slot.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    coordinator: Arc<Coordinator>,
    registry: Arc<AgentRegistry>,
    isolator: Arc<WorkspaceIsolator>,
    invoker: Arc<dyn WorkerInvoker>,
    options: PoolOptions,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
    max_observed: AtomicUsize,
    /// Idle agents this pool registered, by type.
    idle_agents: Mutex<HashMap<String, Vec<AgentId>>>,
    session_id: String,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl WorkerPool {
    pub fn new(
        coordinator: Arc<Coordinator>,
        registry: Arc<AgentRegistry>,
        isolator: Arc<WorkspaceIsolator>,
        invoker: Arc<dyn WorkerInvoker>,
        options: PoolOptions,
    ) -> Self {
        let ceiling = options.max_concurrency.max(1);
        Self {
            coordinator,
            registry,
            isolator,
            invoker,
            options: PoolOptions {
                max_concurrency: ceiling,
                ..options
            },
            slots: Arc::new(Semaphore::new(ceiling)),
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
            idle_agents: Mutex::new(HashMap::new()),
            session_id: uuid::Uuid::new_v4().to_string(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.options.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running tasks seen so far.
    pub fn max_observed_in_flight(&self) -> usize {
        self.max_observed.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every in-flight invocation and stop launching new tasks.
    ///
    /// Completions already written stay written.
    pub fn shutdown(&self) {
        clog!("WorkerPool shutting down, {} task(s) in flight", self.in_flight());
        self.cancel.cancel();
        self.slots.close();
    }

    /// Pick a registered worker type for each task.
    pub fn assign_tasks_to_agents(&self, tasks: &[Task], complexity: Complexity) -> HashMap<TaskId, String> {
        AgentMatcher::new(&self.registry, &self.options.fallback)
            .assign(tasks, complexity)
            .into_iter()
            .map(|a| (a.task_id, a.agent_type))
            .collect()
    }

    /// Execute an enqueued batch level by level.
    ///
    /// Levels run in order; every task of a level is launched concurrently.
    /// Tasks with a dependency that did not complete are failed without
    /// running.
    pub async fn execute_tasks_with_agents(&self, tasks: &[Task]) -> Result<RunSummary> {
        let dag = TaskDAG::from_tasks(tasks)?;
        let complexity = tasks
            .iter()
            .map(|t| t.metadata.complexity)
            .max()
            .unwrap_or_default();
        let assignments = self.assign_tasks_to_agents(tasks, complexity);

        let mut summary = RunSummary::default();
        let mut completed: HashSet<TaskId> = HashSet::new();

        for (level_index, level) in dag.levels()?.into_iter().enumerate() {
            clog!("Level {}: {} task(s)", level_index, level.len());
            self.emit(PoolEvent::LevelStarted {
                level: level_index,
                tasks: level.len(),
            });

            let runs = level.into_iter().map(|task| {
                let agent_type = assignments
                    .get(&task.id)
                    .cloned()
                    .unwrap_or_else(|| task.agent_type.clone());
                let blocked = task.dependencies.iter().find(|d| !completed.contains(*d)).cloned();
                async move {
                    match blocked {
                        Some(dep) => self.skip(task, &agent_type, &dep).await,
                        None => self.run_task(task.clone(), agent_type).await,
                    }
                }
            });
            let reports = join_all(runs).await;

            for report in reports {
                if report.status == TaskStatus::Completed {
                    completed.insert(report.task_id.clone());
                }
                summary.reports.push(report);
            }
        }
        Ok(summary)
    }

    /// Drain the durable queue: repeatedly claim every ready task until
    /// nothing is ready and nothing is running.
    ///
    /// A ready task goes to the first registered type that
    /// `Coordinator::get_next_task` would hand it to; tasks no type claims
    /// are routed by capability scoring. Pending tasks behind a failed
    /// dependency, including ones failed by an earlier process, are failed
    /// without running.
    pub async fn run_pending(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        while !self.is_shut_down() {
            self.skip_blocked(&mut summary).await?;

            let coordinator = Arc::clone(&self.coordinator);
            let ready = blocking(move || coordinator.ready_tasks()).await?;
            if ready.is_empty() {
                break;
            }

            let mut batch: Vec<(Task, String)> = Vec::with_capacity(ready.len());
            let mut unclaimed: Vec<Task> = Vec::new();
            for task in ready {
                let claimant = self.registry.types().iter().find(|agent_type| {
                    let tags: Vec<String> = agent_type.tags().collect();
                    task.claimable_by(&agent_type.name, &tags)
                });
                match claimant {
                    Some(agent_type) => {
                        let name = agent_type.name.clone();
                        batch.push((task, name));
                    }
                    None => unclaimed.push(task),
                }
            }
            if !unclaimed.is_empty() {
                let complexity = unclaimed
                    .iter()
                    .map(|t| t.metadata.complexity)
                    .max()
                    .unwrap_or_default();
                let assignments = self.assign_tasks_to_agents(&unclaimed, complexity);
                for task in unclaimed {
                    let agent_type = assignments
                        .get(&task.id)
                        .cloned()
                        .unwrap_or_else(|| task.agent_type.clone());
                    batch.push((task, agent_type));
                }
            }

            clog_debug!("WorkerPool::run_pending batch={}", batch.len());
            let reports = join_all(
                batch
                    .into_iter()
                    .map(|(task, agent_type)| self.run_task(task, agent_type)),
            )
            .await;
            let progressed = reports.iter().any(|r| r.status.is_terminal());
            summary.reports.extend(reports);
            if !progressed {
                break;
            }
        }
        Ok(summary)
    }

    /// Fail every pending task behind a failed dependency, round by round
    /// so dependents of skipped tasks follow.
    async fn skip_blocked(&self, summary: &mut RunSummary) -> Result<()> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        loop {
            let coordinator = Arc::clone(&self.coordinator);
            let blocked: Vec<(Task, TaskId)> = blocking(move || coordinator.blocked_tasks())
                .await?
                .into_iter()
                .filter(|(task, _)| seen.insert(task.id.clone()))
                .collect();
            // a skip that could not be recorded comes back unchanged
            if blocked.is_empty() {
                return Ok(());
            }
            for (task, dep) in blocked {
                let report = self.skip(&task, &task.agent_type, &dep).await;
                summary.reports.push(report);
            }
        }
    }

    async fn skip(&self, task: &Task, agent_type: &str, dep: &TaskId) -> TaskReport {
        let reason = format!("dependency {} did not complete", dep);
        clog_warn!("Skipping task {}: {}", task.id, reason);
        self.emit(PoolEvent::TaskSkipped {
            task_id: task.id.clone(),
            reason: reason.clone(),
        });
        let coordinator = Arc::clone(&self.coordinator);
        let id = task.id.clone();
        let completion = Completion::failure(reason.clone(), 0);
        if let Err(e) = blocking(move || coordinator.complete_task(&id, completion)).await {
            clog_warn!("Failed to record skipped task {}: {}", task.id, e);
        }
        TaskReport::new(&task.id, agent_type, TaskStatus::Failed, Some(reason))
    }

    /// Run one task end to end. Never returns an error: every failure is
    /// folded into the report and, once claimed, into the store.
    async fn run_task(&self, task: Task, agent_type: String) -> TaskReport {
        // cancelled before a slot: the task stays queued for resume
        let not_started =
            || TaskReport::new(&task.id, &agent_type, TaskStatus::Pending, Some(Error::Cancelled.to_string()));
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit,
            _ = self.cancel.cancelled() => return not_started(),
        };
        let Ok(_permit) = permit else {
            return not_started();
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        let agent_id = match self.claim(&task, &agent_type).await {
            Ok(agent_id) => agent_id,
            Err(e) => {
                clog_warn!("Could not claim task {}: {}", task.id, e);
                let status = self
                    .coordinator
                    .get_task(&task.id)
                    .map_or(TaskStatus::Pending, |t| t.status);
                return TaskReport::new(&task.id, &agent_type, status, Some(e.to_string()));
            }
        };
        self.emit(PoolEvent::TaskStarted {
            task_id: task.id.clone(),
            agent_id: agent_id.clone(),
            agent_type: agent_type.clone(),
        });

        let started = Instant::now();
        let (mut completion, workspace) = self.execute(&task, &agent_type).await;
        completion.metrics.duration_ms = started.elapsed().as_millis() as u64;
        let status = completion.status();
        let error = completion.result.error.clone();

        let coordinator = Arc::clone(&self.coordinator);
        let id = task.id.clone();
        if let Err(e) = blocking(move || coordinator.complete_task(&id, completion)).await {
            clog_warn!("Failed to record completion for {}: {}", task.id, e);
        }

        if let Some(workspace) = workspace {
            let isolator = Arc::clone(&self.isolator);
            if let Err(e) = blocking(move || {
                isolator.remove(&workspace);
                Ok(())
            })
            .await
            {
                clog_warn!("Workspace removal for {} did not finish: {}", task.id, e);
            }
        }

        self.release(&agent_type, agent_id);
        self.emit(PoolEvent::TaskFinished {
            task_id: task.id.clone(),
            status,
        });
        TaskReport::new(&task.id, &agent_type, status, error)
    }

    /// Lease an agent and move the task to in_progress.
    async fn claim(&self, task: &Task, agent_type: &str) -> Result<AgentId> {
        let agent_id = self.lease(agent_type).await?;
        let coordinator = Arc::clone(&self.coordinator);
        let task_id = task.id.clone();
        let leased = agent_id.clone();
        let claimed = blocking(move || {
            coordinator.assign_task(&task_id, &leased)?;
            coordinator.start_task(&task_id)
        })
        .await;
        match claimed {
            Ok(_) => Ok(agent_id),
            Err(e) => {
                // assign is all-or-nothing; if it failed the agent is still idle
                if self
                    .coordinator
                    .get_agent(&agent_id)
                    .is_some_and(|a| a.is_available())
                {
                    self.release(agent_type, agent_id);
                }
                Err(e)
            }
        }
    }

    /// Workspace, worker invocation, commit and merge.
    ///
    /// Returns the completion and the workspace to remove, if one was made.
    async fn execute(&self, task: &Task, agent_type: &str) -> (Completion, Option<Workspace>) {
        let isolator = Arc::clone(&self.isolator);
        let task_id = task.id.clone();
        let created =
            blocking_with_timeout("workspace create", GIT_TIMEOUT, move || isolator.create(&task_id))
                .await;
        let mut workspace = match created {
            Ok(ws) => ws,
            Err(e) => {
                clog_warn!("Workspace creation failed for {}: {}", task.id, e);
                return (Completion::failure(e.to_string(), 0), None);
            }
        };

        let instruction = compose_instruction(task, agent_type, &workspace.path);
        let output = self.invoke(instruction, workspace.path.clone()).await;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                clog_warn!("Task {} failed: {}", task.id, e);
                return (Completion::failure(e.to_string(), 0), Some(workspace));
            }
        };

        let isolator = Arc::clone(&self.isolator);
        let message = format!("{}\n\nTask: {}", task.title, task.id);
        let integrated = blocking_with_timeout("commit and merge", GIT_TIMEOUT, move || {
            let result = isolator
                .commit(&mut workspace, &message)
                .and_then(|_| isolator.merge(&workspace));
            Ok((workspace, result))
        })
        .await;

        match integrated {
            Ok((workspace, Ok(_))) => {
                let mut completion = Completion::success(output.output, 0)
                    .with_revision(workspace.head_revision.clone());
                completion.metrics.cost_usd = output.cost_usd;
                completion.metrics.num_turns = output.num_turns;
                (completion, Some(workspace))
            }
            Ok((workspace, Err(e))) => {
                clog_warn!("Integrating task {} failed: {}", task.id, e);
                (Completion::failure(e.to_string(), 0), Some(workspace))
            }
            Err(e) => {
                // still owned by a blocking thread; cleanup_all sweeps it later
                clog_warn!("Integrating task {} did not finish: {}", task.id, e);
                (Completion::failure(e.to_string(), 0), None)
            }
        }
    }

    /// Invoke the worker under the per-task deadline and the pool's cancel token.
    async fn invoke(&self, instruction: String, path: PathBuf) -> Result<WorkerOutput> {
        let deadline = self.options.task_timeout;
        let call = self.invoker.invoke(instruction, path);
        tokio::select! {
            result = tokio::time::timeout(deadline, call) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(deadline)),
            },
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Reuse an idle agent of this type or register a new one.
    async fn lease(&self, agent_type: &str) -> Result<AgentId> {
        let reused = self
            .idle_agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(agent_type)
            .and_then(Vec::pop);
        if let Some(agent_id) = reused {
            return Ok(agent_id);
        }

        let capabilities = self
            .registry
            .get(agent_type)
            .map(|t| t.tags().collect())
            .unwrap_or_else(|| vec![agent_type.to_string()]);
        let agent = Agent::new(agent_type, capabilities, &self.session_id);
        let coordinator = Arc::clone(&self.coordinator);
        let agent = blocking(move || coordinator.register_agent(agent)).await?;
        clog_debug!("WorkerPool registered agent {} ({})", agent.id.short(), agent_type);
        Ok(agent.id)
    }

    fn release(&self, agent_type: &str, agent_id: AgentId) {
        self.idle_agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent_type.to_string())
            .or_default()
            .push(agent_id);
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Instruction handed to the worker.
pub fn compose_instruction(task: &Task, agent_type: &str, workspace: &std::path::Path) -> String {
    let mut instruction = format!(
        "You are acting as a {}.\n\nTask: {}\n\n{}\n\nWork only inside {}. Leave your changes in the working tree; they are committed for you.",
        agent_type,
        task.title,
        task.description,
        workspace.display()
    );
    if !task.metadata.outputs.is_empty() {
        instruction.push_str(&format!(
            "\n\nExpected outputs: {}.",
            task.metadata.outputs.join(", ")
        ));
    }
    instruction
}
