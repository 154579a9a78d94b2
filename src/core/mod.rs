//! Core domain models: tasks, agents and the dependency DAG.

pub mod agent;
pub mod dag;
pub mod task;

pub use agent::{Agent, AgentId, AgentMetrics, AgentStatus};
pub use dag::TaskDAG;
pub use task::{
    Completion, Complexity, Task, TaskCategory, TaskId, TaskMetadata, TaskMetrics, TaskResult,
    TaskStatus,
};
