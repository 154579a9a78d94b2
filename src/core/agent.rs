//! Agent records: live worker instances of a registered type.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(AgentStatus::Idle),
            "busy" => Some(AgentStatus::Busy),
            "error" => Some(AgentStatus::Error),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    /// Running mean of task durations in milliseconds, over all finished tasks.
    pub average_task_time_ms: f64,
    pub success_rate: f64,
}

impl AgentMetrics {
    pub fn finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Fold one finished task into the running figures.
    pub fn record(&mut self, duration_ms: u64, success: bool) {
        let count = self.finished() as f64;
        self.average_task_time_ms =
            (self.average_task_time_ms * count + duration_ms as f64) / (count + 1.0);
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.success_rate = self.tasks_completed as f64 / self.finished() as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub session_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    pub metrics: AgentMetrics,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_type: &str, capabilities: Vec<String>, session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            agent_type: agent_type.to_string(),
            capabilities,
            session_id: session_id.to_string(),
            metadata: serde_json::Value::Object(Default::default()),
            status: AgentStatus::Idle,
            current_task: None,
            metrics: AgentMetrics::default(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = AgentId::from(id);
        self
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle && self.current_task.is_none()
    }
}
