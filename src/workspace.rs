//! Per-task workspace isolation on top of git worktrees.
//!
//! Each task gets its own branch `<branch_prefix><task_id>` forked from the
//! main line and a worktree at `<root>/<dir_prefix><task_id>`. Every
//! operation that touches the shared repository (refs, worktree admin
//! entries, the main checkout) runs under one lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature, WorktreePruneOptions};
use serde::Serialize;

use crate::core::TaskId;
use crate::{clog_debug, clog_warn, Error, Result};

pub const DEFAULT_DIR_PREFIX: &str = "task-";

/// An isolated checkout owned by one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub branch: String,
    pub path: PathBuf,
    pub base_revision: String,
    pub head_revision: String,
}

impl Workspace {
    pub fn has_changes(&self) -> bool {
        self.base_revision != self.head_revision
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The main line already contains the task branch.
    UpToDate,
    FastForward(String),
    Merged(String),
}

impl MergeOutcome {
    /// Main line revision after the merge, if it moved.
    pub fn revision(&self) -> Option<&str> {
        match self {
            MergeOutcome::UpToDate => None,
            MergeOutcome::FastForward(rev) | MergeOutcome::Merged(rev) => Some(rev),
        }
    }
}

pub struct WorkspaceIsolator {
    repo_path: PathBuf,
    root: PathBuf,
    main_branch: String,
    branch_prefix: String,
    dir_prefix: String,
    lock: Mutex<()>,
}

impl WorkspaceIsolator {
    /// Open the repository at `repo_path`.
    ///
    /// Without an explicit `main_branch` the branch currently checked out
    /// becomes the main line.
    ///
    /// # Errors
    /// `Error::Isolation` if no main line can be determined.
    pub fn new(
        repo_path: &Path,
        root: &Path,
        main_branch: Option<&str>,
        branch_prefix: &str,
    ) -> Result<Self> {
        let repo = Repository::discover(repo_path)?;
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());

        let main_branch = match main_branch {
            Some(name) => name.to_string(),
            None => {
                let head = repo.head()?;
                match (head.is_branch(), head.shorthand()) {
                    (true, Some(name)) => name.to_string(),
                    _ => {
                        return Err(Error::Isolation(
                            "HEAD is detached; set main_branch in the config".to_string(),
                        ))
                    }
                }
            }
        };
        if let Err(e) = repo.find_branch(&main_branch, BranchType::Local) {
            return Err(Error::Isolation(format!(
                "main branch '{}' not found: {}",
                main_branch,
                e.message()
            )));
        }

        clog_debug!(
            "WorkspaceIsolator::new repo={} root={} main={}",
            workdir.display(),
            root.display(),
            main_branch
        );
        Ok(Self {
            repo_path: workdir,
            root: root.to_path_buf(),
            main_branch,
            branch_prefix: branch_prefix.to_string(),
            dir_prefix: DEFAULT_DIR_PREFIX.to_string(),
            lock: Mutex::new(()),
        })
    }

    pub fn with_dir_prefix(mut self, prefix: &str) -> Self {
        self.dir_prefix = prefix.to_string();
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    pub fn branch_name(&self, task_id: &TaskId) -> String {
        format!("{}{}", self.branch_prefix, task_id)
    }

    pub fn workspace_path(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(self.worktree_name(task_id))
    }

    fn worktree_name(&self, task_id: &TaskId) -> String {
        format!("{}{}", self.dir_prefix, task_id)
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current main line revision.
    pub fn main_revision(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(&self.main_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Fork a branch from the main line and check it out in a fresh worktree.
    ///
    /// # Errors
    /// `Error::Isolation` if anything fails; partial state is rolled back
    /// first. A branch left behind by an earlier run is reported, not reused.
    pub fn create(&self, task_id: &TaskId) -> Result<Workspace> {
        let _guard = self.guard();
        let branch = self.branch_name(task_id);
        let path = self.workspace_path(task_id);
        clog_debug!(
            "WorkspaceIsolator::create task={} branch={} path={}",
            task_id,
            branch,
            path.display()
        );

        let repo = self.repo()?;
        if repo.find_branch(&branch, BranchType::Local).is_ok() || path.exists() {
            return Err(Error::Isolation(format!(
                "workspace for task {} already exists",
                task_id
            )));
        }

        match self.create_unlocked(&repo, task_id, &branch, &path) {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                clog_warn!("Workspace create failed for {}, rolling back: {}", task_id, e);
                self.discard(&repo, &self.worktree_name(task_id), &path, &branch);
                Err(Error::Isolation(format!(
                    "failed to create workspace for task {}: {}",
                    task_id, e
                )))
            }
        }
    }

    fn create_unlocked(
        &self,
        repo: &Repository,
        task_id: &TaskId,
        branch: &str,
        path: &Path,
    ) -> Result<Workspace> {
        std::fs::create_dir_all(&self.root)?;
        let base = repo
            .find_branch(&self.main_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let branch_ref = repo.branch(branch, &base, false)?.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(&self.worktree_name(task_id), path, Some(&opts))?;

        let revision = base.id().to_string();
        Ok(Workspace {
            task_id: task_id.clone(),
            branch: branch.to_string(),
            path: path.to_path_buf(),
            base_revision: revision.clone(),
            head_revision: revision,
        })
    }

    /// Stage everything in the workspace and commit it.
    ///
    /// Returns the new head, or the unchanged head when there was nothing to
    /// commit. Never creates an empty commit.
    pub fn commit(&self, workspace: &mut Workspace, message: &str) -> Result<String> {
        let repo = Repository::open(&workspace.path)?;
        let head = repo.head()?.peel_to_commit()?;

        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        if tree_id == head.tree_id() {
            clog_debug!("WorkspaceIsolator::commit task={} nothing to commit", workspace.task_id);
            workspace.head_revision = head.id().to_string();
            return Ok(workspace.head_revision.clone());
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head])?;
        clog_debug!(
            "WorkspaceIsolator::commit task={} commit={}",
            workspace.task_id,
            commit_id
        );
        workspace.head_revision = commit_id.to_string();
        Ok(workspace.head_revision.clone())
    }

    /// Merge the task branch into the main line.
    ///
    /// Fast-forwards when possible, otherwise writes a merge commit. If the
    /// main line is checked out, its working tree follows along.
    ///
    /// # Errors
    /// `Error::Isolation` on conflicts; the main line is left untouched.
    pub fn merge(&self, workspace: &Workspace) -> Result<MergeOutcome> {
        let _guard = self.guard();
        let repo = self.repo()?;

        let main_ref = format!("refs/heads/{}", self.main_branch);
        let ours = repo.find_reference(&main_ref)?.peel_to_commit()?;
        let theirs = repo
            .find_branch(&workspace.branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            clog_debug!("WorkspaceIsolator::merge task={} up to date", workspace.task_id);
            return Ok(MergeOutcome::UpToDate);
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            self.advance_main(&repo, &main_ref, theirs.id(), "fast-forward")?;
            clog_debug!(
                "WorkspaceIsolator::merge task={} fast-forward to {}",
                workspace.task_id,
                theirs.id()
            );
            return Ok(MergeOutcome::FastForward(theirs.id().to_string()));
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let files: Vec<String> = index
                .conflicts()?
                .flatten()
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            return Err(Error::Isolation(format!(
                "merge conflict between {} and {} in: {}",
                workspace.branch,
                self.main_branch,
                files.join(", ")
            )));
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = signature(&repo)?;
        let message = format!("Merge {} into {}", workspace.branch, self.main_branch);
        let merge_id = repo.commit(None, &sig, &sig, &message, &tree, &[&ours, &theirs])?;
        self.advance_main(&repo, &main_ref, merge_id, "merge")?;
        clog_debug!(
            "WorkspaceIsolator::merge task={} merge commit {}",
            workspace.task_id,
            merge_id
        );
        Ok(MergeOutcome::Merged(merge_id.to_string()))
    }

    /// Move the main line ref, updating its checkout first if it is HEAD.
    ///
    /// A safe checkout refuses to overwrite local modifications, in which
    /// case the ref is not moved.
    fn advance_main(&self, repo: &Repository, main_ref: &str, target: Oid, reason: &str) -> Result<()> {
        let checked_out = !repo.is_bare()
            && repo
                .head()
                .ok()
                .and_then(|h| h.name().map(|n| n == main_ref))
                .unwrap_or(false);

        if checked_out {
            let commit = repo.find_commit(target)?;
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            repo.checkout_tree(commit.as_object(), Some(&mut checkout))
                .map_err(|e| {
                    Error::Isolation(format!(
                        "cannot update checkout of {}: {}",
                        self.main_branch,
                        e.message()
                    ))
                })?;
        }
        repo.reference(main_ref, target, true, &format!("conductor: {}", reason))?;
        Ok(())
    }

    /// Delete the worktree, its directory and its branch.
    ///
    /// Failures are logged and swallowed so cleanup never blocks shutdown.
    pub fn remove(&self, workspace: &Workspace) {
        let _guard = self.guard();
        clog_debug!("WorkspaceIsolator::remove task={}", workspace.task_id);
        match self.repo() {
            Ok(repo) => self.discard(
                &repo,
                &self.worktree_name(&workspace.task_id),
                &workspace.path,
                &workspace.branch,
            ),
            Err(e) => clog_warn!("Cannot open repository to remove workspace: {}", e),
        }
    }

    fn discard(&self, repo: &Repository, worktree_name: &str, path: &Path, branch: &str) {
        if let Ok(worktree) = repo.find_worktree(worktree_name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                clog_warn!("Worktree prune failed for '{}': {}", worktree_name, e);
            }
        }

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                clog_warn!("Failed to remove workspace dir {}: {}", path.display(), e);
            }
        }

        let admin_dir = repo.path().join("worktrees").join(worktree_name);
        if admin_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&admin_dir) {
                clog_warn!("Failed to remove worktree admin dir {}: {}", admin_dir.display(), e);
            }
        }

        if branch == self.main_branch {
            return;
        }
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                if let Err(e) = b.delete() {
                    clog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => clog_warn!("Error looking up branch '{}': {}", branch, e),
        }
    }

    /// Remove every worktree, directory and branch carrying this isolator's
    /// prefixes. Returns how many workspaces were swept.
    pub fn cleanup_all(&self) -> usize {
        let _guard = self.guard();
        let repo = match self.repo() {
            Ok(repo) => repo,
            Err(e) => {
                clog_warn!("Cannot open repository for cleanup: {}", e);
                return 0;
            }
        };

        let mut task_ids: Vec<String> = Vec::new();
        if let Ok(worktrees) = repo.worktrees() {
            for name in worktrees.iter().flatten() {
                if let Some(id) = name.strip_prefix(&self.dir_prefix) {
                    task_ids.push(id.to_string());
                }
            }
        }
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Some(id) = entry.file_name().to_str().and_then(|n| n.strip_prefix(&self.dir_prefix)) {
                    task_ids.push(id.to_string());
                }
            }
        }
        if let Ok(branches) = repo.branches(Some(BranchType::Local)) {
            for (branch, _) in branches.flatten() {
                if let Some(id) = branch
                    .name()
                    .ok()
                    .flatten()
                    .and_then(|n| n.strip_prefix(&self.branch_prefix))
                {
                    task_ids.push(id.to_string());
                }
            }
        }
        task_ids.sort();
        task_ids.dedup();

        for id in &task_ids {
            let task_id = TaskId::from(id.as_str());
            self.discard(
                &repo,
                &self.worktree_name(&task_id),
                &self.workspace_path(&task_id),
                &self.branch_name(&task_id),
            );
        }
        clog_debug!("WorkspaceIsolator::cleanup_all swept={}", task_ids.len());
        task_ids.len()
    }

    /// Whether any branch, directory or worktree entry remains for `task_id`.
    pub fn has_residue(&self, task_id: &TaskId) -> Result<bool> {
        let repo = self.repo()?;
        let branch = repo
            .find_branch(&self.branch_name(task_id), BranchType::Local)
            .is_ok();
        let worktree = repo.find_worktree(&self.worktree_name(task_id)).is_ok();
        Ok(branch || worktree || self.workspace_path(task_id).exists())
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("conductor", "conductor@localhost"))?)
}
