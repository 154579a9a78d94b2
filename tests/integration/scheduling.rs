//! Scheduling and execution tests.
//!
//! Dependency ordering through the coordinator, the pool's concurrency
//! ceiling, deadlines, and full request runs against a real repository.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use conductor::core::{Agent, AgentStatus, Completion, Task, TaskId, TaskStatus};
use conductor::orchestration::{Coordinator, PoolEvent};
use conductor::store::Database;
use conductor::Error;

use crate::fixtures::{
    independent_tasks, EchoWorker, FailingWorker, FileWorker, Harness, SelectiveWorker, TrackingWorker,
};

fn coordinator() -> Coordinator {
    Coordinator::new(Arc::new(Database::open_in_memory().unwrap()))
}

/// Given A and B depending on A
/// When A completes
/// Then B becomes the next task
#[test]
fn test_completion_unblocks_dependent() {
    let coord = coordinator();
    let a = Task::new("A", "first", "backend-developer").with_id("A");
    let b = Task::new("B", "second", "backend-developer")
        .with_id("B")
        .depends_on(&TaskId::from("A"));
    coord.enqueue_task(a).unwrap();
    coord.enqueue_task(b).unwrap();
    let agent = coord
        .register_agent(Agent::new("backend-developer", vec![], "s").with_id("agent1"))
        .unwrap();

    let next = coord.get_next_task("backend-developer", &[]).unwrap().unwrap();
    assert_eq!(next.id.as_str(), "A");

    coord.assign_task(&next.id, &agent.id).unwrap();
    assert!(coord.complete_task(&next.id, Completion::success("ok", 10)).unwrap());

    let next = coord.get_next_task("backend-developer", &[]).unwrap().unwrap();
    assert_eq!(next.id.as_str(), "B");
}

/// Given no task with that id
/// When it is assigned
/// Then NotFound is raised and the agent is untouched
#[test]
fn test_assign_missing_task_leaves_agent_untouched() {
    let coord = coordinator();
    let agent = coord
        .register_agent(Agent::new("debugger", vec![], "s").with_id("agent1"))
        .unwrap();

    let err = coord
        .assign_task(&TaskId::from("missing-id"), &agent.id)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let after = coord.get_agent(&agent.id).unwrap();
    assert_eq!(after.status, AgentStatus::Idle);
    assert!(after.current_task.is_none());
    assert_eq!(after, agent);
}

/// Given a ceiling of 2 and three ready tasks
/// When the pool runs them
/// Then at most two overlap and the third starts after one finishes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_ceiling_is_never_exceeded() {
    let worker = Arc::new(TrackingWorker::new(Duration::from_millis(300)));
    let peak = Arc::clone(&worker.peak);
    let harness = Harness::new(worker, 2, 30);
    let tasks = independent_tasks(3);
    harness.enqueue(&tasks);

    let summary = harness
        .runtime
        .pool()
        .execute_tasks_with_agents(&tasks)
        .await
        .unwrap();

    assert!(summary.all_completed(), "{:?}", summary);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(harness.runtime.pool().max_observed_in_flight() <= 2);

    let events = harness.drain_events();
    let first_finish = events
        .iter()
        .position(|e| matches!(e, PoolEvent::TaskFinished { .. }))
        .unwrap();
    let starts: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, PoolEvent::TaskStarted { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(starts.len(), 3);
    assert!(starts[2] > first_finish, "third task started before a slot freed");
}

/// Given a one-second deadline and one slow task beside a fast one
/// When the level runs
/// Then the slow task fails with a timeout and the fast one completes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_fails_only_the_slow_task() {
    let worker = Arc::new(SelectiveWorker {
        marker: "SLOW",
        slow: Duration::from_secs(10),
    });
    let harness = Harness::new(worker, 4, 1);
    let tasks = vec![
        Task::new("SLOW job", "Investigate slowly", "researcher").with_id("slow"),
        Task::new("Quick job", "Investigate quickly", "researcher").with_id("quick"),
    ];
    harness.enqueue(&tasks);

    let summary = harness
        .runtime
        .pool()
        .execute_tasks_with_agents(&tasks)
        .await
        .unwrap();

    let slow = summary.report(&TaskId::from("slow")).unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(summary.report(&TaskId::from("quick")).unwrap().status, TaskStatus::Completed);

    let stored = harness.runtime.coordinator().get_task(&TaskId::from("slow")).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(!harness.runtime.isolator().has_residue(&TaskId::from("slow")).unwrap());
}

/// Given "build a login form"
/// When the request runs with a worker that writes files
/// Then every task completes and its output lands on main
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_build_request_merges_every_task() {
    let harness = Harness::new(Arc::new(FileWorker), 4, 30);
    let (graph, summary) = harness.runtime.run_request("build a login form").await.unwrap();

    assert_eq!(graph.nodes.len(), 4);
    assert!(summary.all_completed(), "{:?}", summary);

    let files = harness.repo.files_on_main();
    for task in &graph.nodes {
        let expected = format!("task-{}.txt", task.id);
        assert!(files.contains(&expected), "{} missing from {:?}", expected, files);
        assert!(!harness.runtime.isolator().has_residue(&task.id).unwrap());
    }

    let status = harness.runtime.status().await.unwrap();
    assert_eq!(status.task_count(TaskStatus::Completed), 4);
    assert!(status.mean_completed_duration_ms.is_some());
}

/// Given "fix the crash"
/// When the request runs
/// Then analysis, implementation and verification start in that order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fix_request_runs_as_a_chain() {
    let harness = Harness::new(Arc::new(EchoWorker), 4, 30);
    let (graph, summary) = harness.runtime.run_request("fix the crash").await.unwrap();
    assert!(summary.all_completed(), "{:?}", summary);

    let started: Vec<TaskId> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            PoolEvent::TaskStarted { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    let expected: Vec<TaskId> = graph.nodes.iter().map(|t| t.id.clone()).collect();
    assert_eq!(started, expected);
    assert!(graph.nodes[0].dependencies.is_empty());
    assert_eq!(graph.nodes[1].dependencies, vec![graph.nodes[0].id.clone()]);
    assert_eq!(graph.nodes[2].dependencies, vec![graph.nodes[1].id.clone()]);
}

/// Given a worker that always fails
/// When a chain runs
/// Then the root fails and its dependents are failed without running
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_dependency_skips_dependents() {
    let harness = Harness::new(Arc::new(FailingWorker), 4, 30);
    let (graph, summary) = harness.runtime.run_request("fix the crash").await.unwrap();

    assert_eq!(summary.count(TaskStatus::Failed), 3);
    assert!(summary.report(&graph.nodes[0].id).unwrap().error.as_deref().unwrap().contains("boom"));

    let skipped = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, PoolEvent::TaskSkipped { .. }))
        .count();
    assert_eq!(skipped, 2);

    let status = harness.runtime.status().await.unwrap();
    assert_eq!(status.task_count(TaskStatus::Failed), 3);
    assert_eq!(status.task_count(TaskStatus::Pending), 0);
}

/// Given tasks enqueued but never run
/// When the queue is drained
/// Then dependents run after their dependencies
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_pending_drains_queue() {
    let harness = Harness::new(Arc::new(EchoWorker), 2, 30);
    let first = Task::new("Research", "Investigate the cache", "researcher").with_id("r1");
    let second = Task::new("Fix", "Fix the cache bug", "debugger")
        .with_id("r2")
        .depends_on(&first.id);
    harness.enqueue(&[first, second]);

    let (recovery, summary) = harness.runtime.resume().await.unwrap();
    assert_eq!(recovery.tasks_loaded, 2);
    assert!(recovery.interrupted.is_empty());
    assert_eq!(summary.count(TaskStatus::Completed), 2);

    let started: Vec<TaskId> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            PoolEvent::TaskStarted { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![TaskId::from("r1"), TaskId::from("r2")]);
}
