//! Orchestration layer.
//!
//! Request decomposition, the transactional coordinator, capability-based
//! worker selection, worker invocation and the bounded worker pool.

pub mod coordinator;
pub mod decomposer;
pub mod matcher;
pub mod pool;
pub mod worker;

pub use coordinator::{AgentCount, Coordinator, Recovery, StatusReport};
pub use decomposer::{classify_intent, estimate_complexity, ExecutionGraph, Intent, QueryDecomposer};
pub use matcher::{AgentMatcher, Assignment};
pub use pool::{PoolEvent, PoolOptions, RunSummary, TaskReport, WorkerPool};
pub use worker::{CommandWorker, WorkerInvoker, WorkerOutput};
