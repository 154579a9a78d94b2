use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_json, parse_ts, unknown_enum};
use crate::core::{Agent, AgentId, AgentMetrics, AgentStatus, TaskId};
use crate::Result;

const COLUMNS: &str = "id, type, capabilities, session_id, metadata, status, current_task, \
     metrics, registered_at, updated_at";

/// Row mapper for the `agents` table.
pub struct AgentStore;

impl AgentStore {
    pub fn upsert(conn: &Connection, agent: &Agent) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                     type = excluded.type,
                     capabilities = excluded.capabilities,
                     session_id = excluded.session_id,
                     metadata = excluded.metadata,
                     status = excluded.status,
                     current_task = excluded.current_task,
                     metrics = excluded.metrics,
                     updated_at = excluded.updated_at",
                COLUMNS
            ),
            params![
                agent.id.as_str(),
                agent.agent_type,
                serde_json::to_string(&agent.capabilities)?,
                agent.session_id,
                serde_json::to_string(&agent.metadata)?,
                agent.status.as_str(),
                agent.current_task.as_ref().map(|t| t.as_str()),
                serde_json::to_string(&agent.metrics)?,
                format_ts(&agent.registered_at),
                format_ts(&agent.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &AgentId) -> Result<Option<Agent>> {
        let agent = conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", COLUMNS),
                [id.as_str()],
                row_to_agent,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Agent>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents ORDER BY registered_at ASC, rowid ASC",
            COLUMNS
        ))?;
        let agents = stmt
            .query_map([], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    /// idle -> busy on `task`. Returns false if the agent was busy or offline.
    pub fn mark_busy(
        conn: &Connection,
        id: &AgentId,
        task: &TaskId,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE agents SET status = 'busy', current_task = ?2, updated_at = ?3
             WHERE id = ?1 AND status NOT IN ('busy', 'offline')",
            params![id.as_str(), task.as_str(), format_ts(now)],
        )?;
        Ok(changed == 1)
    }

    /// Set a status. Anything but busy clears the current task.
    pub fn set_status(
        conn: &Connection,
        id: &AgentId,
        status: AgentStatus,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE agents SET status = ?2,
                 current_task = CASE WHEN ?2 = 'busy' THEN current_task ELSE NULL END,
                 updated_at = ?3
             WHERE id = ?1",
            params![id.as_str(), status.as_str(), format_ts(now)],
        )?;
        Ok(changed == 1)
    }

    /// Release an agent back to idle and store its updated metrics.
    /// An agent taken offline meanwhile stays offline.
    pub fn release(
        conn: &Connection,
        id: &AgentId,
        metrics: &AgentMetrics,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE agents SET current_task = NULL, metrics = ?2, updated_at = ?3,
                 status = CASE status WHEN 'offline' THEN 'offline' ELSE 'idle' END
             WHERE id = ?1",
            params![id.as_str(), serde_json::to_string(metrics)?, format_ts(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn set_all_offline(conn: &Connection, now: &DateTime<Utc>) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE agents SET status = 'offline', current_task = NULL, updated_at = ?1",
            [format_ts(now)],
        )?;
        Ok(changed)
    }

    /// Agent counts keyed by (status, type).
    pub fn count_by_status_and_type(
        conn: &Connection,
    ) -> Result<HashMap<(AgentStatus, String), u64>> {
        let mut stmt = conn.prepare("SELECT status, type, COUNT(*) FROM agents GROUP BY status, type")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            let status = AgentStatus::parse(&raw).ok_or_else(|| unknown_enum(0, &raw))?;
            let count: i64 = row.get(2)?;
            Ok(((status, row.get::<_, String>(1)?), count as u64))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (key, count) = row?;
            counts.insert(key, count);
        }
        Ok(counts)
    }
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let status_raw: String = row.get(5)?;
    let status = AgentStatus::parse(&status_raw).ok_or_else(|| unknown_enum(5, &status_raw))?;
    let capabilities: String = row.get(2)?;
    let metadata: String = row.get(4)?;
    let metrics: String = row.get(7)?;
    let registered_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Agent {
        id: AgentId(row.get(0)?),
        agent_type: row.get(1)?,
        capabilities: parse_json(2, &capabilities)?,
        session_id: row.get(3)?,
        metadata: parse_json(4, &metadata)?,
        status,
        current_task: row.get::<_, Option<String>>(6)?.map(TaskId),
        metrics: parse_json(7, &metrics)?,
        registered_at: parse_ts(8, &registered_at)?,
        updated_at: parse_ts(9, &updated_at)?,
    })
}
