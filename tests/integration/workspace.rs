//! Workspace isolation against a repository created with the git CLI.

use std::sync::Arc;

use conductor::core::{Task, TaskId, TaskStatus};
use conductor::workspace::{MergeOutcome, WorkspaceIsolator};
use conductor::Error;

use crate::fixtures::{ConflictWorker, Harness, TestRepo};

fn isolator(repo: &TestRepo) -> WorkspaceIsolator {
    WorkspaceIsolator::new(&repo.path, &repo.worktree_root(), None, "conductor/task/").unwrap()
}

#[test]
fn test_create_then_remove_leaves_no_residue() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);
    let id = TaskId::from("t1");

    let ws = isolator.create(&id).unwrap();
    assert!(ws.path.join("README.md").exists());
    assert!(repo.branches().contains(&"conductor/task/t1".to_string()));
    assert!(isolator.has_residue(&id).unwrap());

    isolator.remove(&ws);
    assert!(!isolator.has_residue(&id).unwrap());
    assert_eq!(repo.branches(), vec!["main".to_string()]);
    assert!(!ws.path.exists());
}

#[test]
fn test_unchanged_workspace_creates_no_commit() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);
    let before = repo.commit_count();

    let mut ws = isolator.create(&TaskId::from("noop")).unwrap();
    let head = isolator.commit(&mut ws, "nothing").unwrap();
    assert_eq!(head, ws.base_revision);
    assert!(!ws.has_changes());
    assert_eq!(isolator.merge(&ws).unwrap(), MergeOutcome::UpToDate);
    assert_eq!(repo.commit_count(), before);
    isolator.remove(&ws);
}

#[test]
fn test_merge_conflict_leaves_main_untouched() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);

    let mut a = isolator.create(&TaskId::from("a")).unwrap();
    let mut b = isolator.create(&TaskId::from("b")).unwrap();
    std::fs::write(a.path.join("README.md"), "from a\n").unwrap();
    std::fs::write(b.path.join("README.md"), "from b\n").unwrap();
    isolator.commit(&mut a, "a").unwrap();
    isolator.commit(&mut b, "b").unwrap();

    let outcome = isolator.merge(&a).unwrap();
    assert!(matches!(outcome, MergeOutcome::FastForward(_)));
    let main_after_a = repo.main_head();

    let err = isolator.merge(&b).unwrap_err();
    assert!(matches!(&err, Error::Isolation(msg) if msg.contains("README.md")), "{}", err);
    assert_eq!(repo.main_head(), main_after_a);
    assert_eq!(
        std::fs::read_to_string(repo.path.join("README.md")).unwrap(),
        "from a\n"
    );

    isolator.remove(&a);
    isolator.remove(&b);
}

#[test]
fn test_non_overlapping_changes_merge_with_commit() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);

    let mut a = isolator.create(&TaskId::from("left")).unwrap();
    let mut b = isolator.create(&TaskId::from("right")).unwrap();
    std::fs::write(a.path.join("left.txt"), "left\n").unwrap();
    std::fs::write(b.path.join("right.txt"), "right\n").unwrap();
    isolator.commit(&mut a, "left").unwrap();
    isolator.commit(&mut b, "right").unwrap();

    assert!(matches!(isolator.merge(&a).unwrap(), MergeOutcome::FastForward(_)));
    assert!(matches!(isolator.merge(&b).unwrap(), MergeOutcome::Merged(_)));
    let files = repo.files_on_main();
    assert!(files.contains(&"left.txt".to_string()));
    assert!(files.contains(&"right.txt".to_string()));
    assert!(repo.path.join("right.txt").exists());
}

#[test]
fn test_cleanup_all_sweeps_abandoned_workspaces() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);
    for id in ["x", "y"] {
        isolator.create(&TaskId::from(id)).unwrap();
    }
    // a stray directory with the prefix but no worktree entry
    std::fs::create_dir_all(isolator.workspace_path(&TaskId::from("z"))).unwrap();

    assert_eq!(isolator.cleanup_all(), 3);
    for id in ["x", "y", "z"] {
        assert!(!isolator.has_residue(&TaskId::from(id)).unwrap());
    }
    assert_eq!(repo.branches(), vec!["main".to_string()]);
}

#[test]
fn test_create_refuses_existing_workspace() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);
    let id = TaskId::from("dup");
    let ws = isolator.create(&id).unwrap();

    let err = isolator.create(&id).unwrap_err();
    assert!(matches!(err, Error::Isolation(_)));
    // the original workspace survives the refusal
    assert!(ws.path.exists());
    isolator.remove(&ws);
}

/// Given an id git accepts as a branch but not as a worktree name
/// When create fails after the branch is made
/// Then the branch and directory are rolled back
#[test]
fn test_failed_create_rolls_back_branch() {
    let repo = TestRepo::new();
    let isolator = isolator(&repo);
    let id = TaskId::from("x/y");
    let before = repo.main_head();

    let err = isolator.create(&id).unwrap_err();
    assert!(matches!(&err, Error::Isolation(msg) if msg.contains("x/y")), "{}", err);
    assert!(!isolator.has_residue(&id).unwrap());
    assert_eq!(repo.branches(), vec!["main".to_string()]);
    assert_eq!(repo.main_head(), before);

    // the isolator is still usable afterwards
    let ws = isolator.create(&TaskId::from("after")).unwrap();
    isolator.remove(&ws);
}

/// Given two sibling tasks editing the same file
/// When the level runs
/// Then one merges and the other fails with an isolation error
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_reports_conflicting_sibling_as_failed() {
    let harness = Harness::new(Arc::new(ConflictWorker), 4, 30);
    let tasks = vec![
        Task::new("Edit one", "Rewrite the readme", "researcher").with_id("one"),
        Task::new("Edit two", "Rewrite the readme", "researcher").with_id("two"),
    ];
    harness.enqueue(&tasks);

    let summary = harness
        .runtime
        .pool()
        .execute_tasks_with_agents(&tasks)
        .await
        .unwrap();

    assert_eq!(summary.count(TaskStatus::Completed), 1);
    assert_eq!(summary.count(TaskStatus::Failed), 1);
    let failed = summary
        .reports
        .iter()
        .find(|r| r.status == TaskStatus::Failed)
        .unwrap();
    assert!(failed.error.as_deref().unwrap().contains("merge conflict"));
    for task in &tasks {
        assert!(!harness.runtime.isolator().has_residue(&task.id).unwrap());
    }
}
