//! Git plumbing for workspaces: detached worktrees, snapshots, result branches.
//!
//! Every command runs with repository hooks disabled and under a deadline,
//! in its own process group so a timeout also takes down anything it spawned.
//! These calls block; async callers move them onto the blocking pool.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("revision does not resolve to a commit: {0}")]
    UnknownRevision(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("git {command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Identity used for snapshot commits, so workspaces need no user config.
const COMMIT_IDENTITY: [&str; 6] = [
    "-c",
    "user.name=revloop",
    "-c",
    "user.email=revloop@localhost",
    "-c",
    "commit.gpgsign=false",
];

/// Deadline for a single git command.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// How long to wait for output pipes once git has exited.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Hooks of the base repository never run inside revloop's plumbing.
const NO_HOOKS: [&str; 2] = ["-c", "core.hooksPath=/dev/null"];

/// The git subcommand in `args`, skipping `-c key=value` pairs.
fn subcommand<'a>(args: &[&'a str]) -> &'a str {
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        if arg == "-c" {
            iter.next();
        } else {
            return arg;
        }
    }
    ""
}

/// Read `pipe` to the end on a helper thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

/// Kill git and everything it started.
fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Ok(pgid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
}

/// Run git in `dir` and return trimmed stdout.
fn run(dir: &Path, args: &[&str]) -> Result<String> {
    run_with_timeout(dir, args, GIT_TIMEOUT)
}

fn run_with_timeout(dir: &Path, args: &[&str], timeout: Duration) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(NO_HOOKS)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let command = subcommand(args).to_string();
            warn!(command = %command, dir = %dir.display(), ?timeout, "git timed out; killing it");
            kill(&mut child);
            let _ = child.wait();
            return Err(GitError::TimedOut { command, timeout });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.recv_timeout(PIPE_DRAIN_TIMEOUT).unwrap_or_default();
    let stderr = stderr.recv_timeout(PIPE_DRAIN_TIMEOUT).unwrap_or_default();

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            subcommand(args),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8(stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout.trim().to_string())
}

/// Top-level directory of the repository containing `path`.
pub fn repo_root(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(GitError::NotARepo(path.display().to_string()));
    }
    run(path, &["rev-parse", "--show-toplevel"])
        .map(PathBuf::from)
        .map_err(|_| GitError::NotARepo(path.display().to_string()))
}

/// Resolve `rev` to a full commit SHA.
pub fn resolve_commit(repo: &Path, rev: &str) -> Result<String> {
    if rev.is_empty() || rev.starts_with('-') {
        return Err(GitError::UnknownRevision(rev.to_string()));
    }
    run(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")],
    )
    .map_err(|_| GitError::UnknownRevision(rev.to_string()))
}

/// Add a detached worktree at `path` checked out at `commit`.
pub fn add_detached_worktree(repo: &Path, path: &Path, commit: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let path = path.to_string_lossy();
    run(
        repo,
        &["worktree", "add", "--detach", "--quiet", path.as_ref(), commit],
    )?;
    Ok(())
}

/// Force remove a worktree (even with local changes).
pub fn remove_worktree_force(repo: &Path, path: &Path) -> Result<()> {
    let path = path.to_string_lossy();
    run(repo, &["worktree", "remove", "--force", path.as_ref()])?;
    Ok(())
}

/// Drop administrative entries for worktrees whose directories are gone.
pub fn prune_worktrees(repo: &Path) -> Result<()> {
    run(repo, &["worktree", "prune"])?;
    Ok(())
}

/// Paths of all worktrees registered with `repo`, main checkout included.
pub fn list_worktrees(repo: &Path) -> Result<Vec<PathBuf>> {
    let stdout = run(repo, &["worktree", "list", "--porcelain"])?;
    Ok(stdout
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect())
}

/// Commit everything in `workdir` and return the new HEAD.
///
/// Always creates a commit (possibly empty) so each stage has its own
/// revision. The agent's tree is recorded as-is.
pub fn commit_all(workdir: &Path, message: &str) -> Result<String> {
    run(workdir, &["add", "-A"])?;
    let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
    args.extend(["commit", "--allow-empty", "--no-verify", "--quiet", "-m", message]);
    run(workdir, &args)?;
    run(workdir, &["rev-parse", "HEAD"])
}

/// Whether two commits record different trees.
pub fn trees_differ(repo: &Path, a: &str, b: &str) -> Result<bool> {
    let tree_a = run(repo, &["rev-parse", &format!("{a}^{{tree}}")])?;
    let tree_b = run(repo, &["rev-parse", &format!("{b}^{{tree}}")])?;
    Ok(tree_a != tree_b)
}

/// Point `branch` at `commit`, creating or moving it.
pub fn force_branch(repo: &Path, branch: &str, commit: &str) -> Result<()> {
    run(repo, &["check-ref-format", "--branch", branch])
        .map_err(|_| GitError::CommandFailed(format!("invalid branch name: {branch}")))?;
    run(repo, &["branch", "--force", branch, commit])?;
    Ok(())
}
