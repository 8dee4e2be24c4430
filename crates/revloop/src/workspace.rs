//! Isolated, disposable checkouts of the base repository.
//!
//! Each stage gets its own detached `git worktree` under the manager's root.
//! A [`Workspace`] is a guard: dropping it removes the checkout, so every exit
//! path (errors, panics, a cancelled future) releases it.

use crate::git::{self, GitError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid workspace label {0:?}: use letters, digits, '.', '_' or '-'")]
    InvalidLabel(String),
    #[error("workspace label already in use: {0}")]
    LabelInUse(String),
    #[error("cannot check out base repository: {0}")]
    BaseRepo(#[source] GitError),
    #[error("failed to create workspace {label}: {source}")]
    Create {
        label: String,
        #[source]
        source: GitError,
    },
    #[error("failed to snapshot workspace {label}: {source}")]
    Snapshot {
        label: String,
        #[source]
        source: GitError,
    },
    #[error("failed to release workspace {label}: {source}")]
    Release {
        label: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to publish result branch: {0}")]
    Publish(#[source] GitError),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

const MAX_LABEL_LEN: usize = 128;

/// Labels become directory names, so only a conservative charset is allowed.
pub fn validate_label(label: &str) -> Result<()> {
    let valid = !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with(['.', '-'])
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidLabel(label.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One lock per base repository, shared by every manager in the process.
/// `git worktree add` is not safe to run concurrently against the same
/// repository, even from independent runs.
static REPO_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = LazyLock::new(Mutex::default);

fn repo_lock(repo: &Path) -> Arc<Mutex<()>> {
    lock(&REPO_LOCKS).entry(repo.to_path_buf()).or_default().clone()
}

#[derive(Debug, Default)]
struct Registry {
    /// Active label -> checkout path.
    active: Mutex<HashMap<String, PathBuf>>,
}

impl Registry {
    fn forget(&self, label: &str) {
        lock(&self.active).remove(label);
    }
}

/// Creates and tracks workspaces. Cheap to clone; clones share the registry.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    registry: Arc<Registry>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check out `seed` from `base_repo` into a fresh workspace named `label`.
    pub fn acquire(&self, base_repo: &Path, label: &str, seed: &str) -> Result<Workspace> {
        validate_label(label)?;
        let repo = git::repo_root(base_repo).map_err(WorkspaceError::BaseRepo)?;
        let path = self.root.join(label);

        {
            let mut active = lock(&self.registry.active);
            if active.contains_key(label) {
                return Err(WorkspaceError::LabelInUse(label.to_string()));
            }
            active.insert(label.to_string(), path.clone());
        }

        match self.create_checkout(&repo, label, &path, seed) {
            Ok(commit) => {
                debug!(label, path = %path.display(), seed = %commit, "workspace acquired");
                Ok(Workspace {
                    label: label.to_string(),
                    path,
                    repo,
                    seed: commit,
                    registry: Arc::clone(&self.registry),
                    released: false,
                })
            }
            Err(err) => {
                self.registry.forget(label);
                Err(err)
            }
        }
    }

    fn create_checkout(&self, repo: &Path, label: &str, path: &Path, seed: &str) -> Result<String> {
        let repo_mutex = repo_lock(repo);
        let _guard = lock(&repo_mutex);

        let commit = git::resolve_commit(repo, seed).map_err(WorkspaceError::BaseRepo)?;
        if path.exists() {
            return Err(WorkspaceError::Create {
                label: label.to_string(),
                source: GitError::CommandFailed(format!(
                    "{} already exists on disk",
                    path.display()
                )),
            });
        }
        git::add_detached_worktree(repo, path, &commit).map_err(|source| {
            WorkspaceError::Create {
                label: label.to_string(),
                source,
            }
        })?;
        Ok(commit)
    }

    /// Resolve `rev` in `base_repo` to the commit a workspace would start from.
    pub fn resolve(&self, base_repo: &Path, rev: &str) -> Result<String> {
        let repo = git::repo_root(base_repo).map_err(WorkspaceError::BaseRepo)?;
        git::resolve_commit(&repo, rev).map_err(WorkspaceError::BaseRepo)
    }

    /// Whether `revision` changes any file relative to `seed`.
    pub fn has_changes(&self, base_repo: &Path, seed: &str, revision: &str) -> Result<bool> {
        let repo = git::repo_root(base_repo).map_err(WorkspaceError::BaseRepo)?;
        git::trees_differ(&repo, seed, revision).map_err(WorkspaceError::BaseRepo)
    }

    /// Remove a workspace. Equivalent to [`Workspace::release`].
    pub fn release(&self, workspace: Workspace) -> Result<()> {
        workspace.release()
    }

    /// Commit the workspace tree so it can seed the next stage.
    pub fn snapshot(&self, workspace: &Workspace, message: &str) -> Result<String> {
        workspace.snapshot(message)
    }

    /// Point `branch` in `base_repo` at `revision`.
    pub fn publish(&self, base_repo: &Path, branch: &str, revision: &str) -> Result<()> {
        let repo = git::repo_root(base_repo).map_err(WorkspaceError::Publish)?;
        let repo_mutex = repo_lock(&repo);
        let _guard = lock(&repo_mutex);
        git::force_branch(&repo, branch, revision).map_err(WorkspaceError::Publish)?;
        info!(branch, revision, "result branch published");
        Ok(())
    }

    /// Number of workspaces currently checked out through this manager.
    pub fn active_count(&self) -> usize {
        lock(&self.registry.active).len()
    }

    pub fn active_labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = lock(&self.registry.active).keys().cloned().collect();
        labels.sort();
        labels
    }
}

/// A checked-out workspace. Released on drop.
#[derive(Debug)]
pub struct Workspace {
    label: String,
    path: PathBuf,
    repo: PathBuf,
    /// Commit the checkout started from.
    seed: String,
    registry: Arc<Registry>,
    released: bool,
}

impl Workspace {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Commit the current tree and return the new revision.
    pub fn snapshot(&self, message: &str) -> Result<String> {
        git::commit_all(&self.path, message).map_err(|source| WorkspaceError::Snapshot {
            label: self.label.clone(),
            source,
        })
    }

    /// Remove the checkout and its worktree metadata.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    /// Stop tracking the workspace but leave it on disk for inspection.
    pub fn retain(mut self) -> PathBuf {
        self.released = true;
        self.registry.forget(&self.label);
        warn!(label = %self.label, path = %self.path.display(), "workspace retained");
        std::mem::take(&mut self.path)
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let result = self.remove_checkout();
        self.registry.forget(&self.label);
        if result.is_ok() {
            debug!(label = %self.label, "workspace released");
        }
        result
    }

    fn remove_checkout(&self) -> Result<()> {
        let repo_mutex = repo_lock(&self.repo);
        let _guard = lock(&repo_mutex);

        if let Err(err) = git::remove_worktree_force(&self.repo, &self.path) {
            debug!(label = %self.label, error = %err, "worktree remove failed, deleting directory");
            if self.path.exists() {
                std::fs::remove_dir_all(&self.path).map_err(|source| WorkspaceError::Release {
                    label: self.label.clone(),
                    source,
                })?;
            }
            if let Err(err) = git::prune_worktrees(&self.repo) {
                warn!(label = %self.label, error = %err, "worktree prune failed");
            }
        }
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, "workspace release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use tempfile::TempDir;

    fn manager() -> (TempDir, WorkspaceManager) {
        let root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path());
        (root, manager)
    }

    #[test]
    fn label_validation() {
        for ok in ["run-1-i01-review", "a.b_c", "X9"] {
            assert!(validate_label(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".hidden", "-flag", "a/b", "../up", "a b", "tab\there", "ünï"] {
            assert!(
                matches!(validate_label(bad), Err(WorkspaceError::InvalidLabel(_))),
                "{bad:?}"
            );
        }
        assert!(validate_label(&"a".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn acquire_and_release() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();

        let ws = manager.acquire(repo.path(), "ws-1", "main").unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.join("README.md").exists());
        assert_eq!(ws.seed().len(), 40);
        assert_eq!(manager.active_count(), 1);

        manager.release(ws).unwrap();
        assert!(!path.exists());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(git::list_worktrees(repo.path()).unwrap().len(), 1);
    }

    #[test]
    fn label_collision_is_rejected_until_release() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();

        let ws = manager.acquire(repo.path(), "dup", "main").unwrap();
        assert!(matches!(
            manager.acquire(repo.path(), "dup", "main"),
            Err(WorkspaceError::LabelInUse(_))
        ));
        ws.release().unwrap();
        manager.acquire(repo.path(), "dup", "main").unwrap();
    }

    #[test]
    fn failed_acquire_leaves_nothing_registered() {
        let repo = setup_test_repo();
        let not_repo = TempDir::new().unwrap();
        let (_root, manager) = manager();

        assert!(matches!(
            manager.acquire(not_repo.path(), "a", "main"),
            Err(WorkspaceError::BaseRepo(_))
        ));
        assert!(matches!(
            manager.acquire(repo.path(), "b", "does-not-exist"),
            Err(WorkspaceError::BaseRepo(_))
        ));
        assert_eq!(manager.active_count(), 0);
        manager.acquire(repo.path(), "b", "main").unwrap();
    }

    #[test]
    fn drop_releases() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();
        let path = {
            let ws = manager.acquire(repo.path(), "scoped", "main").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn release_tolerates_missing_directory() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();
        let ws = manager.acquire(repo.path(), "gone", "main").unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();

        ws.release().unwrap();
        assert_eq!(manager.active_count(), 0);
        assert_eq!(git::list_worktrees(repo.path()).unwrap().len(), 1);
    }

    #[test]
    fn snapshot_seeds_next_workspace() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();

        let first = manager.acquire(repo.path(), "first", "main").unwrap();
        std::fs::write(first.path().join("fix.txt"), "patched").unwrap();
        let revision = manager.snapshot(&first, "fix").unwrap();
        first.release().unwrap();

        let second = manager.acquire(repo.path(), "second", &revision).unwrap();
        assert_eq!(
            std::fs::read_to_string(second.path().join("fix.txt")).unwrap(),
            "patched"
        );

        manager.publish(repo.path(), "revloop/result", &revision).unwrap();
        assert_eq!(
            git::resolve_commit(repo.path(), "revloop/result").unwrap(),
            revision
        );
    }

    #[test]
    fn retain_keeps_checkout_but_frees_label() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();
        let ws = manager.acquire(repo.path(), "kept", "main").unwrap();

        let path = ws.retain();
        assert!(path.join("README.md").exists());
        assert_eq!(manager.active_count(), 0);

        git::remove_worktree_force(repo.path(), &path).unwrap();
    }

    #[test]
    fn concurrent_acquires_on_one_repo() {
        let repo = setup_test_repo();
        let (_root, manager) = manager();

        let workspaces: Vec<Workspace> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let manager = manager.clone();
                    let repo = repo.path();
                    scope.spawn(move || manager.acquire(repo, &format!("par-{i}"), "main").unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(manager.active_count(), 4);
        drop(workspaces);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn independent_managers_share_repo_lock() {
        let repo = setup_test_repo();
        let managers: Vec<_> = (0..4).map(|_| manager()).collect();

        let workspaces: Vec<Workspace> = std::thread::scope(|scope| {
            let handles: Vec<_> = managers
                .iter()
                .enumerate()
                .map(|(i, (_root, manager))| {
                    let repo = repo.path();
                    scope.spawn(move || manager.acquire(repo, &format!("run-{i}"), "main").unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(git::list_worktrees(repo.path()).unwrap().len(), 5);
        for (_root, manager) in &managers {
            assert_eq!(manager.active_count(), 1);
        }
        drop(workspaces);
        assert_eq!(git::list_worktrees(repo.path()).unwrap().len(), 1);
    }
}
