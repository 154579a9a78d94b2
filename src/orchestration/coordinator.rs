//! Coordinator: the transactional authority over task and agent lifecycle.
//!
//! Every state change goes through here. Each mutation is one SQLite
//! transaction; the in-memory caches are refreshed from the committed rows
//! only after the transaction succeeds, so a failed call never leaves the
//! cache ahead of the store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;

use crate::core::{Agent, AgentId, AgentStatus, Completion, Task, TaskDAG, TaskId, TaskStatus};
use crate::store::{AgentStore, Database, TaskStore};
use crate::{clog_debug, clog_warn, Error, Result};

/// Aggregate view of the durable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub tasks: HashMap<TaskStatus, u64>,
    pub agents: Vec<AgentCount>,
    /// Mean duration of completed tasks, `None` until one completes.
    pub mean_completed_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentCount {
    pub status: AgentStatus,
    pub agent_type: String,
    pub count: u64,
}

impl StatusReport {
    pub fn task_count(&self, status: TaskStatus) -> u64 {
        self.tasks.get(&status).copied().unwrap_or(0)
    }

    pub fn total_tasks(&self) -> u64 {
        self.tasks.values().sum()
    }

    pub fn agent_count(&self, status: AgentStatus, agent_type: &str) -> u64 {
        self.agents
            .iter()
            .find(|c| c.status == status && c.agent_type == agent_type)
            .map_or(0, |c| c.count)
    }
}

/// What `load_from_database` found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recovery {
    pub tasks_loaded: usize,
    pub agents_loaded: usize,
    /// Tasks that were assigned or running when the previous process died.
    pub interrupted: Vec<TaskId>,
}

pub struct Coordinator {
    db: Arc<Database>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
}

impl Coordinator {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            tasks: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Validate and persist a new pending task.
    ///
    /// Dependencies must already be known, so a new task can never close a
    /// cycle through the stored graph.
    ///
    /// # Errors
    /// `Error::Validation` for malformed tasks, duplicate ids, self
    /// dependencies and unknown dependencies.
    pub fn enqueue_task(&self, task: Task) -> Result<()> {
        clog_debug!("Coordinator::enqueue_task id={} type={}", task.id, task.agent_type);
        self.db.with_tx(|tx| {
            validate_new_task(tx, &task)?;
            TaskStore::insert(tx, &task)
        })?;
        write(&self.tasks).insert(task.id.clone(), task);
        Ok(())
    }

    /// Validate a batch as a whole, then persist it in dependency order.
    ///
    /// The batch is all-or-nothing: one bad task rejects every task.
    /// Dependencies on tasks outside the batch are rejected too.
    pub fn enqueue_graph(&self, tasks: &[Task]) -> Result<Vec<TaskId>> {
        let dag = TaskDAG::from_tasks(tasks)?;
        let ordered: Vec<Task> = dag.topological_order()?.into_iter().cloned().collect();
        clog_debug!("Coordinator::enqueue_graph tasks={}", ordered.len());

        self.db.with_tx(|tx| {
            for task in &ordered {
                validate_new_task(tx, task)?;
                TaskStore::insert(tx, task)?;
            }
            Ok(())
        })?;

        let mut cache = write(&self.tasks);
        let ids = ordered.iter().map(|t| t.id.clone()).collect();
        for task in ordered {
            cache.insert(task.id.clone(), task);
        }
        Ok(ids)
    }

    /// Best ready task for an agent of `agent_type` carrying `capabilities`.
    ///
    /// Ordered by priority (highest first), then age. Only tasks whose
    /// dependencies are all completed are considered.
    pub fn get_next_task(&self, agent_type: &str, capabilities: &[String]) -> Result<Option<Task>> {
        self.db
            .with_conn(|conn| TaskStore::next_ready(conn, agent_type, capabilities))
    }

    /// Every claimable task, best first.
    pub fn ready_tasks(&self) -> Result<Vec<Task>> {
        self.db.with_conn(TaskStore::ready)
    }

    /// Pending tasks stuck behind a failed dependency, with that dependency.
    pub fn blocked_tasks(&self) -> Result<Vec<(Task, TaskId)>> {
        self.db.with_conn(TaskStore::blocked)
    }

    /// Claim a pending task for an agent in one transaction.
    ///
    /// # Errors
    /// - `Error::NotFound` if the task or agent is unknown
    /// - `Error::Conflict` if the task is no longer pending, has incomplete
    ///   dependencies, or the agent is busy or offline
    ///
    /// On error nothing is written.
    pub fn assign_task(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<Task> {
        clog_debug!("Coordinator::assign_task task={} agent={}", task_id, agent_id);
        let now = Utc::now();
        let (task, agent) = self.db.with_tx(|tx| {
            let task = TaskStore::get(tx, task_id)?
                .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
            let agent = AgentStore::get(tx, agent_id)?
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;

            if task.status != TaskStatus::Pending {
                return Err(Error::Conflict(format!(
                    "task {} is {}, not pending",
                    task_id, task.status
                )));
            }
            if !TaskStore::dependencies_completed(tx, task_id)? {
                return Err(Error::Conflict(format!(
                    "task {} has incomplete dependencies",
                    task_id
                )));
            }
            if matches!(agent.status, AgentStatus::Busy | AgentStatus::Offline) {
                return Err(Error::Conflict(format!(
                    "agent {} is {}",
                    agent_id, agent.status
                )));
            }

            if !TaskStore::mark_assigned(tx, task_id, agent_id, &now)? {
                return Err(Error::Conflict(format!("task {} was claimed concurrently", task_id)));
            }
            if !AgentStore::mark_busy(tx, agent_id, task_id, &now)? {
                return Err(Error::Conflict(format!("agent {} was claimed concurrently", agent_id)));
            }
            reload_pair(tx, task_id, Some(agent_id))
        })?;

        self.refresh(task.clone(), agent);
        Ok(task)
    }

    /// Mark an assigned task as running.
    pub fn start_task(&self, task_id: &TaskId) -> Result<Task> {
        clog_debug!("Coordinator::start_task task={}", task_id);
        let now = Utc::now();
        let task = self.db.with_tx(|tx| {
            let task = TaskStore::get(tx, task_id)?
                .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
            if !task.status.can_advance_to(TaskStatus::InProgress)
                || !TaskStore::mark_started(tx, task_id, &now)?
            {
                return Err(Error::Conflict(format!(
                    "task {} is {}, not assigned",
                    task_id, task.status
                )));
            }
            TaskStore::get(tx, task_id)?
                .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
        })?;
        write(&self.tasks).insert(task.id.clone(), task.clone());
        Ok(task)
    }

    /// Record a task outcome and release its agent.
    ///
    /// Returns `false` without writing anything when the id is unknown or the
    /// task already finished; late or duplicate reports are tolerated.
    pub fn complete_task(&self, task_id: &TaskId, completion: Completion) -> Result<bool> {
        clog_debug!(
            "Coordinator::complete_task task={} success={} duration_ms={}",
            task_id,
            completion.success,
            completion.metrics.duration_ms
        );
        let now = Utc::now();
        let outcome = self.db.with_tx(|tx| {
            let Some(task) = TaskStore::get(tx, task_id)? else {
                return Ok(None);
            };
            if task.is_finished() || !TaskStore::mark_finished(tx, task_id, &completion, &now)? {
                return Ok(None);
            }

            if let Some(agent_id) = &task.assigned_agent {
                if let Some(mut agent) = AgentStore::get(tx, agent_id)? {
                    agent
                        .metrics
                        .record(completion.metrics.duration_ms, completion.success);
                    AgentStore::release(tx, agent_id, &agent.metrics, &now)?;
                }
            }
            reload_pair(tx, task_id, task.assigned_agent.as_ref()).map(Some)
        })?;

        match outcome {
            Some((task, agent)) => {
                self.refresh(task, agent);
                Ok(true)
            }
            None => {
                clog_warn!("Ignoring completion for unknown or finished task {}", task_id);
                Ok(false)
            }
        }
    }

    pub fn register_agent(&self, agent: Agent) -> Result<Agent> {
        clog_debug!("Coordinator::register_agent id={} type={}", agent.id, agent.agent_type);
        let stored = self.db.with_tx(|tx| {
            AgentStore::upsert(tx, &agent)?;
            AgentStore::get(tx, &agent.id)?
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent.id)))
        })?;
        write(&self.agents).insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    /// Set an agent's status. Any status other than busy clears its task.
    pub fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<Agent> {
        clog_debug!("Coordinator::update_agent_status agent={} status={}", agent_id, status);
        let now = Utc::now();
        let agent = self.db.with_tx(|tx| {
            if !AgentStore::set_status(tx, agent_id, status, &now)? {
                return Err(Error::NotFound(format!("agent {}", agent_id)));
            }
            AgentStore::get(tx, agent_id)?
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))
        })?;
        write(&self.agents).insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        read(&self.tasks).get(task_id).cloned()
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<Agent> {
        read(&self.agents).get(agent_id).cloned()
    }

    /// Cached tasks, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = read(&self.tasks).values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = read(&self.agents).values().cloned().collect();
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    /// Aggregate counts, always read from the store.
    pub fn get_status(&self) -> Result<StatusReport> {
        self.db.with_conn(|conn| {
            let tasks = TaskStore::count_by_status(conn)?;
            let mut agents: Vec<AgentCount> = AgentStore::count_by_status_and_type(conn)?
                .into_iter()
                .map(|((status, agent_type), count)| AgentCount {
                    status,
                    agent_type,
                    count,
                })
                .collect();
            agents.sort_by(|a, b| {
                a.agent_type
                    .cmp(&b.agent_type)
                    .then_with(|| a.status.as_str().cmp(b.status.as_str()))
            });
            Ok(StatusReport {
                tasks,
                agents,
                mean_completed_duration_ms: TaskStore::mean_completed_duration_ms(conn)?,
            })
        })
    }

    /// Rebuild both caches from the store.
    ///
    /// Tasks left assigned or running by a dead process are failed with an
    /// "interrupted" error and their agents go back to idle, in the same
    /// transaction.
    pub fn load_from_database(&self) -> Result<Recovery> {
        let now = Utc::now();
        let (tasks, agents, interrupted) = self.db.with_tx(|tx| {
            let stranded =
                TaskStore::list_by_status(tx, &[TaskStatus::Assigned, TaskStatus::InProgress])?;
            let mut interrupted = Vec::with_capacity(stranded.len());
            for task in stranded {
                let completion = Completion::failure(
                    format!("interrupted: process exited while task was {}", task.status),
                    0,
                );
                TaskStore::mark_finished(tx, &task.id, &completion, &now)?;
                if let Some(agent_id) = &task.assigned_agent {
                    AgentStore::set_status(tx, agent_id, AgentStatus::Idle, &now)?;
                }
                interrupted.push(task.id);
            }
            Ok((TaskStore::list(tx)?, AgentStore::list(tx)?, interrupted))
        })?;

        for id in &interrupted {
            clog_warn!("Task {} was interrupted by a previous run, marked failed", id);
        }

        let recovery = Recovery {
            tasks_loaded: tasks.len(),
            agents_loaded: agents.len(),
            interrupted,
        };
        *write(&self.tasks) = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        *write(&self.agents) = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        clog_debug!(
            "Coordinator::load_from_database tasks={} agents={} interrupted={}",
            recovery.tasks_loaded,
            recovery.agents_loaded,
            recovery.interrupted.len()
        );
        Ok(recovery)
    }

    /// Take every agent offline and drop the caches.
    pub fn cleanup(&self) -> Result<()> {
        let changed = self
            .db
            .with_tx(|tx| AgentStore::set_all_offline(tx, &Utc::now()))?;
        clog_debug!("Coordinator::cleanup agents_offline={}", changed);
        write(&self.tasks).clear();
        write(&self.agents).clear();
        Ok(())
    }

    fn refresh(&self, task: Task, agent: Option<Agent>) {
        write(&self.tasks).insert(task.id.clone(), task);
        if let Some(agent) = agent {
            write(&self.agents).insert(agent.id.clone(), agent);
        }
    }
}

fn validate_new_task(conn: &Connection, task: &Task) -> Result<()> {
    if task.id.as_str().trim().is_empty() {
        return Err(Error::Validation("task id must not be empty".to_string()));
    }
    // the id names the task's branch and worktree
    let id = task.id.as_str();
    if id.contains('/') || !git2::Reference::is_valid_name(&format!("refs/heads/{}", id)) {
        return Err(Error::Validation(format!(
            "task id {:?} cannot name a branch or worktree",
            id
        )));
    }
    if task.title.trim().is_empty() {
        return Err(Error::Validation(format!("task {} has an empty title", task.id)));
    }
    if task.agent_type.trim().is_empty() {
        return Err(Error::Validation(format!("task {} has no agent type", task.id)));
    }
    if task.status != TaskStatus::Pending {
        return Err(Error::Validation(format!(
            "task {} must be enqueued as pending, got {}",
            task.id, task.status
        )));
    }
    if task.dependencies.contains(&task.id) {
        return Err(Error::Validation(format!("task {} depends on itself", task.id)));
    }
    if TaskStore::exists(conn, &task.id)? {
        return Err(Error::Validation(format!("task {} already exists", task.id)));
    }
    for dep in &task.dependencies {
        if !TaskStore::exists(conn, dep)? {
            return Err(Error::Validation(format!(
                "task {} depends on unknown task {}",
                task.id, dep
            )));
        }
    }
    Ok(())
}

fn reload_pair(
    conn: &Connection,
    task_id: &TaskId,
    agent_id: Option<&AgentId>,
) -> Result<(Task, Option<Agent>)> {
    let task = TaskStore::get(conn, task_id)?
        .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
    let agent = match agent_id {
        Some(id) => AgentStore::get(conn, id)?,
        None => None,
    };
    Ok((task, agent))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
