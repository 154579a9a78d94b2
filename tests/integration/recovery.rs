//! Crash recovery against a file-backed store.

use std::sync::Arc;

use tempfile::TempDir;

use conductor::core::{Agent, AgentStatus, Completion, Task, TaskId, TaskStatus};
use conductor::orchestration::{Coordinator, PoolEvent};
use conductor::store::{Database, TaskStore};

use crate::fixtures::{EchoWorker, Harness};

fn open(dir: &TempDir) -> Coordinator {
    let db = Database::open(&dir.path().join("state").join("conductor.db")).unwrap();
    Coordinator::new(Arc::new(db))
}

/// Given a process that died with one task running
/// When a new process loads the store
/// Then the running task is failed as interrupted and counts match the store
#[test]
fn test_restart_recovers_interrupted_work() {
    let dir = TempDir::new().unwrap();
    {
        let coord = open(&dir);
        let tasks: Vec<Task> = ["done", "running", "waiting"]
            .iter()
            .map(|id| Task::new(id, "work", "debugger").with_id(*id))
            .collect();
        coord.enqueue_graph(&tasks).unwrap();

        let a1 = coord.register_agent(Agent::new("debugger", vec![], "old").with_id("a1")).unwrap();
        let a2 = coord.register_agent(Agent::new("debugger", vec![], "old").with_id("a2")).unwrap();
        coord.assign_task(&TaskId::from("done"), &a1.id).unwrap();
        coord.start_task(&TaskId::from("done")).unwrap();
        coord.complete_task(&TaskId::from("done"), Completion::success("ok", 1200)).unwrap();

        coord.assign_task(&TaskId::from("running"), &a2.id).unwrap();
        coord.start_task(&TaskId::from("running")).unwrap();
        // process dies here: no completion, no cleanup
    }

    let coord = open(&dir);
    let recovery = coord.load_from_database().unwrap();
    assert_eq!(recovery.tasks_loaded, 3);
    assert_eq!(recovery.agents_loaded, 2);
    assert_eq!(recovery.interrupted, vec![TaskId::from("running")]);

    let running = coord.get_task(&TaskId::from("running")).unwrap();
    assert_eq!(running.status, TaskStatus::Failed);
    assert!(running.result.unwrap().error.unwrap().starts_with("interrupted"));
    let a2 = coord.get_agent(&"a2".into()).unwrap();
    assert_eq!(a2.status, AgentStatus::Idle);
    assert!(a2.current_task.is_none());

    let status = coord.get_status().unwrap();
    let durable = coord.database().with_conn(TaskStore::count_by_status).unwrap();
    assert_eq!(status.tasks, durable);
    assert_eq!(status.task_count(TaskStatus::Completed), 1);
    assert_eq!(status.task_count(TaskStatus::Failed), 1);
    assert_eq!(status.task_count(TaskStatus::Pending), 1);
    assert_eq!(status.agent_count(AgentStatus::Idle, "debugger"), 2);
    assert_eq!(status.mean_completed_duration_ms, Some(1200.0));

    // the untouched task is still claimable
    let next = coord.get_next_task("debugger", &[]).unwrap().unwrap();
    assert_eq!(next.id.as_str(), "waiting");
}

/// Given one agent finishing several tasks
/// Then its stored running average is the arithmetic mean
#[test]
fn test_agent_average_survives_restart() {
    let dir = TempDir::new().unwrap();
    let durations = [100u64, 250, 400, 1000];
    {
        let coord = open(&dir);
        let agent = coord
            .register_agent(Agent::new("researcher", vec![], "s").with_id("r"))
            .unwrap();
        for (i, d) in durations.iter().enumerate() {
            let id = TaskId::from(format!("t{}", i));
            coord
                .enqueue_task(Task::new("t", "work", "researcher").with_id(id.clone()))
                .unwrap();
            coord.assign_task(&id, &agent.id).unwrap();
            coord.complete_task(&id, Completion::success("ok", *d)).unwrap();
        }
    }

    let coord = open(&dir);
    coord.load_from_database().unwrap();
    let agent = coord.get_agent(&"r".into()).unwrap();
    let mean = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
    assert!((agent.metrics.average_task_time_ms - mean).abs() < 1e-9);
    assert_eq!(agent.metrics.tasks_completed, durations.len() as u64);
}

/// Given a clean shutdown
/// Then every agent is offline in the store
#[test]
fn test_cleanup_takes_agents_offline() {
    let dir = TempDir::new().unwrap();
    {
        let coord = open(&dir);
        coord.register_agent(Agent::new("researcher", vec![], "s").with_id("r")).unwrap();
        coord.cleanup().unwrap();
        assert!(coord.agents().is_empty());
    }
    let coord = open(&dir);
    coord.load_from_database().unwrap();
    assert_eq!(coord.get_agent(&"r".into()).unwrap().status, AgentStatus::Offline);
}

/// Given a chain A <- B <- C and a process that died while A was running
/// When the queue is resumed
/// Then B and C are failed behind A instead of waiting forever
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resume_fails_dependents_of_interrupted_task() {
    let harness = Harness::new(Arc::new(EchoWorker), 2, 30);
    let a = Task::new("A", "first", "researcher").with_id("A");
    let b = Task::new("B", "second", "researcher").with_id("B").depends_on(&a.id);
    let c = Task::new("C", "third", "researcher").with_id("C").depends_on(&b.id);
    let free = Task::new("Free", "unrelated", "researcher").with_id("free");
    harness.enqueue(&[a, b, c, free]);

    let coord = harness.runtime.coordinator();
    let agent = coord
        .register_agent(Agent::new("researcher", vec![], "old").with_id("old"))
        .unwrap();
    coord.assign_task(&TaskId::from("A"), &agent.id).unwrap();
    coord.start_task(&TaskId::from("A")).unwrap();

    let (recovery, summary) = harness.runtime.resume().await.unwrap();
    assert_eq!(recovery.interrupted, vec![TaskId::from("A")]);

    let b = summary.report(&TaskId::from("B")).unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("dependency A did not complete"));
    let c = summary.report(&TaskId::from("C")).unwrap();
    assert_eq!(c.error.as_deref(), Some("dependency B did not complete"));
    assert_eq!(summary.report(&TaskId::from("free")).unwrap().status, TaskStatus::Completed);

    let skipped: Vec<TaskId> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            PoolEvent::TaskSkipped { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![TaskId::from("B"), TaskId::from("C")]);

    let status = harness.runtime.status().await.unwrap();
    assert_eq!(status.task_count(TaskStatus::Pending), 0);
    assert_eq!(status.task_count(TaskStatus::Failed), 3);

    // nothing left to drain on a second resume
    let (_, again) = harness.runtime.resume().await.unwrap();
    assert!(again.reports.is_empty());
}
