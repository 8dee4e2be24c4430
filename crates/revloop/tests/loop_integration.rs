//! End-to-end runs against a real git repository and a shell-script agent.

#![cfg(unix)]

use revloop::runner::{ProcessRunner, RunnerConfig};
use revloop::{LoopController, LoopSettings, WorkspaceManager};
use revloop_core::{Config, ReportStore, RunId, RunStatus, StageStatus};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const AGENT: &str = r#"#!/bin/sh
case "$REVLOOP_ROLE" in
  reviewer)
    echo "CRITICAL: missing bounds check (iteration $REVLOOP_ITERATION)"
    ;;
  developer)
    echo "patched" > "fix-$REVLOOP_ITERATION.txt"
    echo "Added the bounds check."
    ;;
  validator)
    if [ "$REVLOOP_ITERATION" -ge 2 ]; then
      printf 'UNRESOLVED: critical=0 high=0 medium=1 low=0\nVALIDATION: PASSED\n'
    else
      printf 'UNRESOLVED: critical=1 high=0 medium=0 low=0\nVALIDATION: FAILED\n'
    fi
    ;;
  finalizer)
    echo "Ready for merge."
    ;;
esac
"#;

struct Fixture {
    repo: TempDir,
    runs: TempDir,
    workspaces: TempDir,
    scratch: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let repo = TempDir::new().unwrap();
        let git = |args: &[&str]| {
            let out = Command::new("git")
                .args(args)
                .current_dir(repo.path())
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        };
        git(&["init", "--quiet"]);
        git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&["config", "user.email", "test@test.com"]);
        git(&["config", "user.name", "Test"]);
        git(&["config", "commit.gpgsign", "false"]);
        std::fs::write(repo.path().join("lib.rs"), "fn main() {}\n").unwrap();
        git(&["add", "."]);
        git(&["commit", "--quiet", "-m", "Initial commit"]);

        Self {
            repo,
            runs: TempDir::new().unwrap(),
            workspaces: TempDir::new().unwrap(),
            scratch: TempDir::new().unwrap(),
        }
    }

    fn agent(&self, body: &str) -> PathBuf {
        let path = self.scratch.path().join("agent.sh");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn prompt_dir(&self) -> PathBuf {
        self.scratch.path().join("prompts")
    }

    fn config(&self, agent: PathBuf) -> Config {
        Config {
            agent_bin: agent,
            agent_args: Vec::new(),
            reviewer_args: Vec::new(),
            developer_args: Vec::new(),
            validator_args: Vec::new(),
            finalizer_args: Vec::new(),
            prompt_dir: Some(self.prompt_dir()),
            runs_dir: self.runs.path().to_path_buf(),
            workspaces_dir: self.workspaces.path().to_path_buf(),
            ..Config::default()
        }
    }

    fn controller(&self, config: &Config) -> LoopController<ProcessRunner> {
        LoopController::new(
            LoopSettings::from_config(config, self.repo.path(), "main"),
            ProcessRunner::new(RunnerConfig::from_config(config)),
            WorkspaceManager::new(&config.workspaces_dir),
            ReportStore::new(&config.runs_dir),
        )
        .with_run_id(RunId::from_string("it"))
    }

    fn leftover_prompts(&self) -> usize {
        std::fs::read_dir(self.prompt_dir()).map_or(0, |entries| entries.count())
    }
}

fn worktree_count(repo: &Path) -> usize {
    let out = Command::new("git")
        .args(["worktree", "list", "--porcelain"])
        .current_dir(repo)
        .output()
        .unwrap();
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter(|line| line.starts_with("worktree "))
        .count()
}

#[tokio::test]
async fn rejected_then_approved_run_produces_artifacts() {
    let fx = Fixture::new();
    let mut config = fx.config(fx.agent(AGENT));
    config.max_iterations = 2;
    config.finalize_agent = true;

    let controller = fx.controller(&config);
    let outcome = controller.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome.error);
    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    assert_eq!(outcome.run.current_iteration, 2);

    let run_dir = outcome.run_dir();
    for name in [
        "iter-01-review.md",
        "iter-01-fix.md",
        "iter-01-validate.md",
        "iter-02-review.md",
        "iter-02-fix.md",
        "iter-02-validate.md",
        "iter-02-finalize.md",
        "events.tsv",
        "summary.md",
        "summary.json",
    ] {
        assert!(run_dir.join(name).is_file(), "missing {name}");
    }

    let summary = std::fs::read_to_string(run_dir.join("summary.md")).unwrap();
    assert!(summary.contains("iter-01-review.md"));
    assert!(summary.contains("iter-02-review.md"));
    assert!(summary.contains("Added the bounds check."));
    assert!(summary.contains("Ready for merge."));
    assert!(summary.contains("1 issue(s) unresolved"));

    assert_eq!(outcome.result_branch.as_deref(), Some("revloop/it"));
    assert_eq!(controller.workspaces().active_count(), 0);
    assert_eq!(worktree_count(fx.repo.path()), 1);
    assert_eq!(fx.leftover_prompts(), 0);
}

#[tokio::test]
async fn oversized_prompts_travel_by_file() {
    let fx = Fixture::new();
    // Fail the stage unless the prompt arrived as a readable file.
    let agent = fx.agent(
        r#"#!/bin/sh
if [ "$1" != "-f" ] || [ ! -r "$2" ]; then
  echo "prompt was not delivered by file" >&2
  exit 3
fi
grep -q "automated review loop" "$2" || exit 4
if [ "$REVLOOP_ROLE" = validator ]; then
  printf 'UNRESOLVED: critical=0 high=0 medium=0 low=0\nVALIDATION: PASSED\n'
fi
"#,
    );
    let mut config = fx.config(agent);
    config.max_iterations = 1;
    config.prompt_threshold = 16;

    let controller = fx.controller(&config);
    let outcome = controller.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome.error);
    let iteration = &outcome.iterations[0];
    for stage in [&iteration.review, &iteration.fix, &iteration.validate] {
        let stage = stage.as_ref().unwrap();
        assert_eq!(stage.status, StageStatus::Succeeded);
        assert_eq!(stage.prompt_delivery, revloop_core::PromptDelivery::File);
        assert!(!stage.prompt_file.as_ref().unwrap().exists());
    }
    assert_eq!(fx.leftover_prompts(), 0);
    // Nothing changed, so there is nothing to publish.
    assert!(outcome.result_branch.is_none());
}

#[tokio::test]
async fn validator_timeout_aborts_with_effective_deadline() {
    let fx = Fixture::new();
    let agent = fx.agent(
        r#"#!/bin/sh
if [ "$REVLOOP_ROLE" = validator ]; then
  sleep 5
fi
echo ok
"#,
    );
    let mut config = fx.config(agent);
    config.agent_timeout_sec = 1;

    let controller = fx.controller(&config);
    let started = std::time::Instant::now();
    let outcome = controller.run(&CancellationToken::new()).await.unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(outcome.run.status, RunStatus::Aborted);
    assert!(outcome.run.reason.as_deref().unwrap().contains("after 1 seconds"));
    let validate = outcome.iterations[0].validate.as_ref().unwrap();
    assert_eq!(validate.status, StageStatus::TimedOut);
    assert_eq!(controller.workspaces().active_count(), 0);
    assert_eq!(worktree_count(fx.repo.path()), 1);
    assert!(outcome.run_dir().join("summary.json").is_file());
    assert!(!outcome.run_dir().join("summary.md").exists());
}

#[tokio::test]
async fn cancellation_kills_agent_and_cleans_up() {
    let fx = Fixture::new();
    let agent = fx.agent("#!/bin/sh\nsleep 30\n");
    let config = fx.config(agent);

    let controller = fx.controller(&config);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let outcome = controller.run(&cancel).await.unwrap();

    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(outcome.run.status, RunStatus::Aborted);
    assert_eq!(controller.workspaces().active_count(), 0);
    assert_eq!(worktree_count(fx.repo.path()), 1);
    assert_eq!(fx.leftover_prompts(), 0);
}
