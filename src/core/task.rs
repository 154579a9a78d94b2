//! Task data model.
//!
//! Tasks are the atomic units of work handed to workers. Status only moves
//! forward: pending, assigned, in_progress, then completed or failed.

use crate::core::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Generated ids are UUID v4 strings; ids supplied by callers are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// First 8 characters, for display and branch names.
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Position in the forward order. Both terminal states share the last rank.
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Assigned => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether moving to `next` is a strict forward step.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Estimated difficulty of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    High,
    Critical,
}

impl Complexity {
    /// Scale factor applied to template durations.
    pub fn duration_multiplier(&self) -> f64 {
        match self {
            Complexity::Simple => 1.0,
            Complexity::Medium => 1.5,
            Complexity::High => 2.0,
            Complexity::Critical => 3.0,
        }
    }

    pub fn bump(self) -> Self {
        match self {
            Complexity::Simple => Complexity::Medium,
            Complexity::Medium => Complexity::High,
            Complexity::High | Complexity::Critical => Complexity::Critical,
        }
    }

    pub fn is_high(&self) -> bool {
        matches!(self, Complexity::High | Complexity::Critical)
    }
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Simple
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::High => "high",
            Complexity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// What kind of work a task is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category")]
pub enum TaskCategory {
    Architecture,
    Backend,
    Frontend,
    Testing,
    Analysis,
    Implementation {
        /// Area the fix targets (frontend, backend, general).
        focus: String,
    },
    Verification,
    Planning,
    Research,
    General,
}

impl Default for TaskCategory {
    fn default() -> Self {
        Self::General
    }
}

/// Typed task metadata, with `extra` for anything unstructured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(flatten)]
    pub category: TaskCategory,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What a worker produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Head revision of the task branch when the task finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

/// Completion report handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
    pub result: TaskResult,
    pub metrics: TaskMetrics,
}

impl Completion {
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            result: TaskResult {
                output: Some(output.into()),
                ..Default::default()
            },
            metrics: TaskMetrics {
                duration_ms,
                ..Default::default()
            },
        }
    }

    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            result: TaskResult {
                error: Some(error.into()),
                ..Default::default()
            },
            metrics: TaskMetrics {
                duration_ms,
                ..Default::default()
            },
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.result.revision = Some(revision.into());
        self
    }

    pub fn status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Required capability tag (a worker type name).
    pub agent_type: String,
    pub dependencies: Vec<TaskId>,
    pub priority: i32,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    pub assigned_agent: Option<AgentId>,
    pub result: Option<TaskResult>,
    pub metrics: Option<TaskMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with a generated id.
    pub fn new(title: &str, description: &str, agent_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            agent_type: agent_type.to_string(),
            dependencies: Vec::new(),
            priority: 0,
            status: TaskStatus::Pending,
            metadata: TaskMetadata::default(),
            assigned_agent: None,
            result: None,
            metrics: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a dependency, ignoring duplicates.
    pub fn depends_on(mut self, id: &TaskId) -> Self {
        if !self.dependencies.contains(id) {
            self.dependencies.push(id.clone());
        }
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether an agent of `agent_type` carrying `capabilities` may run this task.
    pub fn claimable_by(&self, agent_type: &str, capabilities: &[String]) -> bool {
        self.agent_type == agent_type || capabilities.iter().any(|c| c == &self.agent_type)
    }

    /// Text used for keyword matching.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.title, self.description).to_lowercase()
    }
}
