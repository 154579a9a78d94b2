use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_json, parse_opt_ts, parse_ts, unknown_enum};
use crate::core::{AgentId, Completion, Task, TaskId, TaskStatus};
use crate::Result;

const COLUMNS: &str = "id, title, description, agent_type, dependencies, priority, status, \
     metadata, assigned_agent, result, metrics, created_at, updated_at, assigned_at, completed_at";

/// Row mapper for the `tasks` and `task_dependencies` tables.
pub struct TaskStore;

impl TaskStore {
    /// Insert a task row plus one edge row per dependency.
    ///
    /// Callers are expected to run this inside a transaction so the task and
    /// its edges land together.
    pub fn insert(conn: &Connection, task: &Task) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                COLUMNS
            ),
            params![
                task.id.as_str(),
                task.title,
                task.description,
                task.agent_type,
                serde_json::to_string(&task.dependencies)?,
                task.priority,
                task.status.as_str(),
                serde_json::to_string(&task.metadata)?,
                task.assigned_agent.as_ref().map(|a| a.as_str()),
                task.result.as_ref().map(serde_json::to_string).transpose()?,
                task.metrics.as_ref().map(serde_json::to_string).transpose()?,
                format_ts(&task.created_at),
                format_ts(&task.updated_at),
                task.assigned_at.as_ref().map(format_ts),
                task.completed_at.as_ref().map(format_ts),
            ],
        )?;

        let mut edge = conn.prepare_cached(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
        )?;
        for dep in &task.dependencies {
            edge.execute(params![task.id.as_str(), dep.as_str()])?;
        }
        Ok(())
    }

    pub fn exists(conn: &Connection, id: &TaskId) -> Result<bool> {
        let found = conn
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", [id.as_str()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(conn: &Connection, id: &TaskId) -> Result<Option<Task>> {
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                [id.as_str()],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Every task in creation order.
    pub fn list(conn: &Connection) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY created_at ASC, rowid ASC",
            COLUMNS
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn list_by_status(conn: &Connection, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        Ok(Self::list(conn)?
            .into_iter()
            .filter(|t| statuses.contains(&t.status))
            .collect())
    }

    /// Pending tasks whose dependencies are all completed, best first.
    ///
    /// A dependency edge pointing at a missing row counts as incomplete.
    pub fn ready(conn: &Connection) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks t
             WHERE t.status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM task_dependencies d
                   LEFT JOIN tasks dep ON dep.id = d.depends_on
                   WHERE d.task_id = t.id
                     AND (dep.id IS NULL OR dep.status != 'completed')
               )
             ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC",
            prefixed_columns("t")
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Pending tasks that can never become ready because a dependency
    /// failed, each paired with one failed dependency, oldest first.
    pub fn blocked(conn: &Connection) -> Result<Vec<(Task, TaskId)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, MIN(d.depends_on) FROM tasks t
             JOIN task_dependencies d ON d.task_id = t.id
             JOIN tasks dep ON dep.id = d.depends_on
             WHERE t.status = 'pending' AND dep.status = 'failed'
             GROUP BY t.id
             ORDER BY t.created_at ASC, t.rowid ASC",
            prefixed_columns("t")
        ))?;
        let blocked = stmt
            .query_map([], |row| Ok((row_to_task(row)?, TaskId(row.get(15)?))))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocked)
    }

    /// Highest-priority ready task claimable by the given agent type or tags.
    pub fn next_ready(
        conn: &Connection,
        agent_type: &str,
        capabilities: &[String],
    ) -> Result<Option<Task>> {
        Ok(Self::ready(conn)?
            .into_iter()
            .find(|task| task.claimable_by(agent_type, capabilities)))
    }

    /// Whether every dependency of `id` exists and is completed.
    pub fn dependencies_completed(conn: &Connection, id: &TaskId) -> Result<bool> {
        let blocking: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task_dependencies d
             LEFT JOIN tasks dep ON dep.id = d.depends_on
             WHERE d.task_id = ?1
               AND (dep.id IS NULL OR dep.status != 'completed')",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(blocking == 0)
    }

    /// pending -> assigned. Returns false if the task was not pending.
    pub fn mark_assigned(
        conn: &Connection,
        id: &TaskId,
        agent: &AgentId,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let ts = format_ts(now);
        let changed = conn.execute(
            "UPDATE tasks SET status = 'assigned', assigned_agent = ?2,
                 assigned_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id.as_str(), agent.as_str(), ts],
        )?;
        Ok(changed == 1)
    }

    /// assigned -> in_progress. Returns false if the task was not assigned.
    pub fn mark_started(conn: &Connection, id: &TaskId, now: &DateTime<Utc>) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', updated_at = ?2
             WHERE id = ?1 AND status = 'assigned'",
            params![id.as_str(), format_ts(now)],
        )?;
        Ok(changed == 1)
    }

    /// Move a non-terminal task to completed or failed.
    /// Returns false if the task was already terminal.
    pub fn mark_finished(
        conn: &Connection,
        id: &TaskId,
        completion: &Completion,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let ts = format_ts(now);
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, result = ?3, metrics = ?4,
                 completed_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            params![
                id.as_str(),
                completion.status().as_str(),
                serde_json::to_string(&completion.result)?,
                serde_json::to_string(&completion.metrics)?,
                ts,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn count_by_status(conn: &Connection) -> Result<HashMap<TaskStatus, u64>> {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status = TaskStatus::parse(&raw).ok_or_else(|| unknown_enum(0, &raw))?;
            Ok((status, count as u64))
        })?;
        let mut counts: HashMap<TaskStatus, u64> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Mean `duration_ms` over completed tasks, `None` if there are none.
    pub fn mean_completed_duration_ms(conn: &Connection) -> Result<Option<f64>> {
        let mean: Option<f64> = conn.query_row(
            "SELECT AVG(json_extract(metrics, '$.duration_ms')) FROM tasks
             WHERE status = 'completed' AND metrics IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(mean)
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(6)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| unknown_enum(6, &status_raw))?;

    let dependencies: String = row.get(4)?;
    let metadata: String = row.get(7)?;
    let result: Option<String> = row.get(9)?;
    let metrics: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(Task {
        id: TaskId(row.get(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        agent_type: row.get(3)?,
        dependencies: parse_json(4, &dependencies)?,
        priority: row.get(5)?,
        status,
        metadata: parse_json(7, &metadata)?,
        assigned_agent: row.get::<_, Option<String>>(8)?.map(AgentId),
        result: result.map(|r| parse_json(9, &r)).transpose()?,
        metrics: metrics.map(|m| parse_json(10, &m)).transpose()?,
        created_at: parse_ts(11, &created_at)?,
        updated_at: parse_ts(12, &updated_at)?,
        assigned_at: parse_opt_ts(13, row.get(13)?)?,
        completed_at: parse_opt_ts(14, row.get(14)?)?,
    })
}
