//! Shutdown guard wired to a live runtime.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{AgentStatus, Task, TaskStatus};
use conductor::shutdown::{Decision, GuardState, Signal, EXIT_INTERRUPTED, EXIT_OK};

use crate::fixtures::{EchoWorker, Harness, SelectiveWorker};

/// Wait until the pool reports running work.
async fn wait_for_in_flight(harness: &Harness) {
    for _ in 0..200 {
        if harness.runtime.pool().in_flight() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no task started");
}

/// Given a task executing
/// When interrupt arrives once, then again within a second
/// Then the first blocks and the second forces exit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupts_while_executing() {
    let worker = Arc::new(SelectiveWorker {
        marker: "Long",
        slow: Duration::from_secs(2),
    });
    let harness = Arc::new(Harness::new(worker, 2, 30));
    let tasks = vec![Task::new("Long job", "Investigate at length", "researcher").with_id("long")];
    harness.enqueue(&tasks);

    let runner = Arc::clone(&harness);
    let run = tokio::spawn(async move {
        runner.runtime.pool().execute_tasks_with_agents(&tasks).await
    });
    wait_for_in_flight(&harness).await;

    let guard = harness.runtime.shutdown_guard();
    assert_eq!(guard.handle(Signal::Interrupt), Decision::Block);
    assert_eq!(guard.state(), GuardState::Executing);
    assert_eq!(guard.handle(Signal::Interrupt), Decision::Exit(EXIT_INTERRUPTED));
    assert_eq!(guard.state(), GuardState::ForceExit);

    let summary = run.await.unwrap().unwrap();
    assert!(summary.all_completed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupt_when_idle_exits_immediately() {
    let harness = Harness::new(Arc::new(EchoWorker), 2, 30);
    let guard = harness.runtime.shutdown_guard();
    assert_eq!(guard.handle(Signal::Interrupt), Decision::Exit(EXIT_INTERRUPTED));
    assert_eq!(guard.state(), GuardState::Normal);
}

/// Given a task executing
/// When terminate arrives
/// Then the pool is cancelled, the task is failed and agents go offline
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_cancels_in_flight_work() {
    let worker = Arc::new(SelectiveWorker {
        marker: "Long",
        slow: Duration::from_secs(30),
    });
    let harness = Arc::new(Harness::new(worker, 2, 60));
    let tasks = vec![Task::new("Long job", "Investigate at length", "researcher").with_id("long")];
    harness.enqueue(&tasks);

    let runner = Arc::clone(&harness);
    let run = tokio::spawn(async move {
        runner.runtime.pool().execute_tasks_with_agents(&tasks).await
    });
    wait_for_in_flight(&harness).await;

    let guard = harness.runtime.shutdown_guard();
    assert_eq!(guard.handle(Signal::Terminate), Decision::Exit(EXIT_OK));
    assert!(harness.runtime.pool().is_shut_down());

    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("pool stops after terminate")
        .unwrap()
        .unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("cancelled"));

    let status = harness.runtime.status().await.unwrap();
    assert_eq!(status.task_count(TaskStatus::Failed), 1);
    let offline: u64 = status
        .agents
        .iter()
        .filter(|c| c.status == AgentStatus::Offline)
        .map(|c| c.count)
        .sum();
    assert_eq!(offline, 1, "late completion must not revive an offline agent");
}
