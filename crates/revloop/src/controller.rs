//! The review loop: Review → Fix → Validate, repeated until approval or the
//! iteration budget runs out, then Finalize.
//!
//! Every stage runs in a freshly acquired workspace seeded from the previous
//! successful stage's snapshot. Stages are strictly sequential; one control
//! task owns the [`Run`] and is the only thing that mutates it.

use crate::finalizer::{self, ExitReason, FinalizeError, SummaryInput};
use crate::runner::{AgentRequest, AgentRunner, AgentStatus, InvocationError, StageFailure};
use crate::workspace::{WorkspaceError, WorkspaceManager};
use chrono::Utc;
use revloop_core::ledger::{Event, EventKind, Ledger};
use revloop_core::prompt::{self, PromptContext};
use revloop_core::report::{ReportError, ReportStore};
use revloop_core::verdict::parse_verdict;
use revloop_core::{Config, Iteration, Run, RunId, RunStatus, Stage, StageRole, StageStatus, Verdict};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Start,
    Review,
    Fix,
    Validate,
    Finalize,
    End,
    Aborted,
}

/// Inputs to [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    Started,
    StageDone,
    Verdict { approved: bool },
    Finalized,
    Fatal,
    Cancelled,
}

/// Next state after `event` in `state`, during iteration `iteration` of
/// `max_iterations`.
///
/// Terminal states absorb every event. Pairs that cannot happen abort.
pub fn transition(state: LoopState, event: LoopEvent, iteration: u32, max_iterations: u32) -> LoopState {
    use LoopEvent as E;
    use LoopState as S;

    match (state, event) {
        (S::End | S::Aborted, _) => state,
        (_, E::Fatal | E::Cancelled) => S::Aborted,
        (S::Start, E::Started) => S::Review,
        (S::Review, E::StageDone) => S::Fix,
        (S::Fix, E::StageDone) => S::Validate,
        (S::Validate, E::Verdict { approved: true }) => S::Finalize,
        (S::Validate, E::Verdict { approved: false }) if iteration < max_iterations => S::Review,
        (S::Finalize, E::Finalized) => S::End,
        _ => S::Aborted,
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("failed to open event ledger: {0}")]
    Ledger(#[source] std::io::Error),
    #[error("failed to write run summary: {0}")]
    Finalize(#[from] FinalizeError),
    #[error("validator stage produced no verdict: {0}")]
    ValidatorFailed(#[source] StageFailure),
    #[error("iteration budget exhausted with unresolved issues")]
    BudgetExhausted { max_iterations: u32 },
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid loop transition out of {0:?}")]
    InvalidTransition(LoopState),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LoopError {
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            Self::BudgetExhausted { .. } => ExitReason::BudgetExhausted,
            Self::Cancelled => ExitReason::Cancelled,
            _ => ExitReason::Error,
        }
    }

    /// Terminal run status this error leads to.
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::BudgetExhausted { .. } => RunStatus::Failed,
            _ => RunStatus::Aborted,
        }
    }

    fn as_event(&self) -> LoopEvent {
        match self {
            Self::Cancelled => LoopEvent::Cancelled,
            _ => LoopEvent::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;

/// Per-run settings for the controller.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub base_repo: PathBuf,
    /// Revision under review; the first stage is seeded from it.
    pub target: String,
    pub base_branch: String,
    /// Review only the target's last commit.
    pub latest: bool,
    pub max_iterations: u32,
    /// Deadline for each agent call.
    pub timeout_sec: u64,
    pub retain_failed_workspaces: bool,
    pub finalize_agent: bool,
    pub result_branch_prefix: String,
}

impl LoopSettings {
    pub fn from_config(config: &Config, base_repo: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            base_repo: base_repo.into(),
            target: target.into(),
            base_branch: config.base_branch.clone(),
            latest: config.latest,
            max_iterations: config.max_iterations,
            timeout_sec: config.agent_timeout_sec,
            retain_failed_workspaces: config.retain_failed_workspaces,
            finalize_agent: config.finalize_agent,
            result_branch_prefix: config.result_branch_prefix.clone(),
        }
    }
}

/// What a finished run left behind.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: Run,
    pub iterations: Vec<Iteration>,
    /// The finalizer agent stage, when one ran.
    pub finalizer: Option<Stage>,
    pub exit_reason: ExitReason,
    /// Why the run did not succeed.
    pub error: Option<LoopError>,
    pub result_branch: Option<String>,
    pub retained_workspaces: Vec<PathBuf>,
    pub summary_md: Option<PathBuf>,
    pub summary_json: PathBuf,
}

impl RunOutcome {
    pub fn run_dir(&self) -> &Path {
        &self.run.root_dir
    }

    pub fn last_verdict(&self) -> Option<&Verdict> {
        self.iterations.iter().rev().find_map(|it| it.verdict.as_ref())
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_reason.exit_code()
    }
}

/// Mutable state of one run, owned by the control task.
#[derive(Debug)]
struct RunState {
    run: Run,
    ledger: Ledger,
    iterations: Vec<Iteration>,
    finalizer: Option<Stage>,
    /// Commit the run started from.
    seed: String,
    /// Revision diffs are taken against, when not `base_branch`.
    compare_base: Option<String>,
    /// Commit the next stage starts from.
    tip: String,
    retained: Vec<PathBuf>,
    /// This iteration's review and development reports.
    review: Option<String>,
    development: Option<String>,
}

impl RunState {
    fn record_event(&mut self, event: &Event) {
        if let Err(err) = self.ledger.record(event) {
            warn!(run_id = %self.run.id, error = %err, "failed to write ledger row");
        }
    }

    fn begin_iteration(&mut self) -> u32 {
        let index = self.run.next_iteration();
        self.iterations.push(Iteration::new(index));
        self.review = None;
        self.development = None;
        index
    }

    fn current(&mut self) -> Option<&mut Iteration> {
        self.iterations.last_mut()
    }
}

struct StageRun {
    stage: Stage,
    /// Agent stdout, for verdict parsing.
    stdout: String,
    report: String,
    failure: Option<StageFailure>,
}

fn failure_report(role: StageRole, failure: &StageFailure, output: &str) -> String {
    let mut report = format!(
        "# {} Report\n\nThe {} stage did not complete: {failure}.\n",
        role.title(),
        role.as_str()
    );
    if !output.trim().is_empty() {
        report.push_str("\n## Captured output\n\n");
        report.push_str(output.trim_end());
        report.push('\n');
    }
    report
}

/// Run blocking git plumbing on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

fn elapsed_ms(since: chrono::DateTime<Utc>) -> u64 {
    u64::try_from((Utc::now() - since).num_milliseconds()).unwrap_or(0)
}

/// Drives one run through the loop.
#[derive(Debug)]
pub struct LoopController<R> {
    settings: LoopSettings,
    runner: R,
    workspaces: WorkspaceManager,
    reports: ReportStore,
    run_id: Option<RunId>,
}

impl<R: AgentRunner> LoopController<R> {
    pub fn new(settings: LoopSettings, runner: R, workspaces: WorkspaceManager, reports: ReportStore) -> Self {
        Self {
            settings,
            runner,
            workspaces,
            reports,
            run_id: None,
        }
    }

    /// Use a fixed run id instead of generating one.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Execute the run to a terminal state.
    ///
    /// Loop failures end up in [`RunOutcome::error`]. `Err` means the run
    /// directory, ledger or summaries could not be written.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let run_id = self.run_id.clone().unwrap_or_default();
        let run_dir = self.reports.init_run(&run_id)?;
        let ledger = Ledger::in_run_dir(&run_dir).map_err(LoopError::Ledger)?;

        let mut st = RunState {
            run: Run::new(run_id, run_dir, self.settings.max_iterations),
            ledger,
            iterations: Vec::new(),
            finalizer: None,
            seed: String::new(),
            compare_base: None,
            tip: String::new(),
            retained: Vec::new(),
            review: None,
            development: None,
        };

        info!(
            run_id = %st.run.id,
            target = %self.settings.target,
            max_iterations = self.settings.max_iterations,
            timeout_sec = self.settings.timeout_sec,
            run_dir = %st.run.root_dir.display(),
            "run started"
        );
        let start = Event::new(EventKind::RunStart)
            .with_status(st.run.status.as_str())
            .with_artifact(&st.run.root_dir)
            .with_message(format!("target={}", self.settings.target));
        st.record_event(&start);

        let error = self.drive(&mut st, cancel).await.err();
        self.finish(st, error).await
    }

    async fn drive(&self, st: &mut RunState, cancel: &CancellationToken) -> Result<()> {
        let workspaces = self.workspaces.clone();
        let repo = self.settings.base_repo.clone();
        let target = self.settings.target.clone();
        let latest = self.settings.latest;
        let (seed, parent) = blocking(move || {
            let seed = workspaces.resolve(&repo, &target)?;
            let parent = if latest {
                Some(workspaces.resolve(&repo, &format!("{seed}~1"))?)
            } else {
                None
            };
            Ok::<_, WorkspaceError>((seed, parent))
        })
        .await??;
        if let Some(parent) = &parent {
            info!(run_id = %st.run.id, compare_base = %parent, "reviewing the latest commit only");
        }
        st.seed = seed;
        st.compare_base = parent;
        st.tip = st.seed.clone();

        let max = self.settings.max_iterations;
        let mut state = transition(LoopState::Start, LoopEvent::Started, 0, max);
        st.begin_iteration();

        loop {
            let iteration = st.run.current_iteration;
            let event = match self.step(st, state, cancel).await {
                Ok(event) => event,
                Err(err) => {
                    let next = transition(state, err.as_event(), iteration, max);
                    debug!(from = ?state, to = ?next, error = %err, "loop aborted");
                    return Err(err);
                }
            };

            let next = transition(state, event, iteration, max);
            debug!(from = ?state, to = ?next, iteration, "loop transition");

            match (state, next) {
                (LoopState::Validate, LoopState::Review) => {
                    info!(run_id = %st.run.id, iteration, "changes rejected; starting next iteration");
                    st.begin_iteration();
                }
                (LoopState::Validate, LoopState::Aborted) => {
                    return Err(LoopError::BudgetExhausted { max_iterations: max });
                }
                (_, LoopState::End) => return Ok(()),
                (_, LoopState::Aborted) => return Err(LoopError::InvalidTransition(state)),
                _ => {}
            }
            state = next;
        }
    }

    async fn step(&self, st: &mut RunState, state: LoopState, cancel: &CancellationToken) -> Result<LoopEvent> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        let iteration = st.run.current_iteration;

        match state {
            LoopState::Review | LoopState::Fix | LoopState::Validate => {
                let role = match state {
                    LoopState::Review => StageRole::Reviewer,
                    LoopState::Fix => StageRole::Developer,
                    _ => StageRole::Validator,
                };
                let prior = self.reports.aggregate(&st.run.id, iteration.saturating_sub(1))?;
                let prompt = prompt::build(role, &self.prompt_context(st, prior));
                let outcome = self.run_stage(st, role, iteration, &prompt, cancel).await?;

                if outcome.stage.status == StageStatus::Cancelled {
                    if let Some(current) = st.current() {
                        current.record(outcome.stage);
                    }
                    return Err(LoopError::Cancelled);
                }

                match role {
                    StageRole::Reviewer => st.review = Some(outcome.report),
                    StageRole::Developer => st.development = Some(outcome.report),
                    _ => {}
                }

                let Some(current) = st.current() else {
                    return Err(LoopError::InvalidTransition(state));
                };
                current.record(outcome.stage);

                if role != StageRole::Validator {
                    return Ok(LoopEvent::StageDone);
                }
                if let Some(failure) = outcome.failure {
                    return Err(LoopError::ValidatorFailed(failure));
                }

                let mut verdict = parse_verdict(&outcome.stdout);
                if !verdict.marker_found {
                    warn!(iteration, "validator output has no VALIDATION marker; treating as rejected");
                }
                let failures = current.upstream_failures();
                if !failures.is_empty() {
                    verdict.withhold(failures.join("; "));
                }
                info!(iteration, verdict = %verdict, "validation verdict");

                let approved = verdict.approved;
                current.verdict = Some(verdict);
                Ok(LoopEvent::Verdict { approved })
            }
            LoopState::Finalize => {
                if self.settings.finalize_agent {
                    self.run_finalizer_agent(st, iteration, cancel).await?;
                }
                Ok(LoopEvent::Finalized)
            }
            LoopState::Start | LoopState::End | LoopState::Aborted => Err(LoopError::InvalidTransition(state)),
        }
    }

    async fn run_finalizer_agent(&self, st: &mut RunState, iteration: u32, cancel: &CancellationToken) -> Result<()> {
        let mut ctx = self.prompt_context(st, self.reports.aggregate(&st.run.id, iteration)?);
        ctx.review = None;
        ctx.development = None;
        let prompt = prompt::build(StageRole::Finalizer, &ctx);

        let outcome = self
            .run_stage(st, StageRole::Finalizer, iteration, &prompt, cancel)
            .await?;
        let cancelled = outcome.stage.status == StageStatus::Cancelled;
        if let Some(failure) = &outcome.failure {
            if !cancelled {
                warn!(iteration, error = %failure, "finalizer agent failed; writing summary without it");
            }
        }
        st.finalizer = Some(outcome.stage);
        if cancelled {
            return Err(LoopError::Cancelled);
        }
        Ok(())
    }

    fn prompt_context(&self, st: &RunState, prior_context: String) -> PromptContext {
        PromptContext {
            target: self.settings.target.clone(),
            base_branch: self.settings.base_branch.clone(),
            compare_base: st.compare_base.clone(),
            iteration: st.run.current_iteration,
            max_iterations: self.settings.max_iterations,
            prior_context,
            review: st.review.clone(),
            development: st.development.clone(),
        }
    }

    /// Run one stage in its own workspace and persist its report.
    ///
    /// Agent failures come back inside the result; only workspace,
    /// invocation and report errors are `Err`.
    async fn run_stage(
        &self,
        st: &mut RunState,
        role: StageRole,
        iteration: u32,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<StageRun> {
        let label = format!("{}-i{iteration:02}-{}", st.run.id, role.slug());
        let mut stage = Stage::pending(role, iteration, self.settings.timeout_sec);
        stage.workspace_label.clone_from(&label);
        stage.prompt_chars = prompt.chars().count();

        st.record_event(
            &Event::new(EventKind::StageStart)
                .with_stage(role, iteration)
                .with_status(StageStatus::Running.as_str())
                .with_message(format!("workspace={label}")),
        );

        let workspaces = self.workspaces.clone();
        let (repo, ws_label, seed) = (self.settings.base_repo.clone(), label.clone(), st.tip.clone());
        let workspace = blocking(move || workspaces.acquire(&repo, &ws_label, &seed)).await??;
        stage.workspace_path = workspace.path().to_path_buf();
        stage.started_at = Some(Utc::now());
        stage.status = StageStatus::Running;
        info!(
            run_id = %st.run.id,
            role = role.as_str(),
            iteration,
            label = %label,
            timeout_sec = self.settings.timeout_sec,
            "stage started"
        );

        let request = AgentRequest {
            role,
            iteration,
            workdir: workspace.path(),
            prompt,
            timeout_sec: self.settings.timeout_sec,
        };
        let result = self.runner.invoke(request, cancel).await?;

        stage.ended_at = Some(Utc::now());
        stage.status = result.status.stage_status();
        stage.exit_code = result.exit_code;
        stage.prompt_delivery = result.delivery;
        stage.prompt_file.clone_from(&result.prompt_file);
        stage.timeout_sec = result.timeout_sec;
        let failure = result.failure();
        stage.error = failure.as_ref().map(ToString::to_string);

        // Only successful stages seed the next one.
        let workspace = if result.status == AgentStatus::Succeeded {
            let message = format!("revloop {}: iteration {iteration} {}", st.run.id, role.slug());
            let (workspace, snapshot) = blocking(move || {
                let snapshot = workspace.snapshot(&message);
                (workspace, snapshot)
            })
            .await?;
            st.tip = snapshot?;
            workspace
        } else {
            workspace
        };

        let output = result.output();
        let content = match &failure {
            None if output.trim().is_empty() => format!("# {} Report\n\n(no output)\n", role.title()),
            None => output,
            Some(failure) => failure_report(role, failure, &output),
        };
        let report = self.reports.append(&st.run.id, role, iteration, &content)?;
        stage.report_path = Some(report.path.clone());

        if failure.is_some() && self.settings.retain_failed_workspaces {
            st.retained.push(workspace.retain());
        } else {
            blocking(move || workspace.release()).await??;
        }

        let mut end = Event::new(EventKind::StageEnd)
            .with_stage(role, iteration)
            .with_status(stage.status.as_str())
            .with_duration_ms(result.duration_ms)
            .with_exit_code(result.exit_code)
            .with_output_bytes(result.stdout.len() as u64)
            .with_artifact(&report.path);
        if let Some(error) = &stage.error {
            end = end.with_message(error.clone());
        }
        st.record_event(&end);

        info!(
            run_id = %st.run.id,
            role = role.as_str(),
            iteration,
            status = stage.status.as_str(),
            duration_ms = result.duration_ms,
            report = %report.path.display(),
            "stage finished"
        );

        Ok(StageRun {
            stage,
            stdout: result.stdout,
            report: report.content,
            failure,
        })
    }

    /// Terminate the run, publish the result branch and write summaries.
    async fn finish(&self, mut st: RunState, error: Option<LoopError>) -> Result<RunOutcome> {
        let (status, reason) = match &error {
            None => (RunStatus::Succeeded, None),
            Some(err) => (err.run_status(), Some(err.to_string())),
        };
        st.run.terminate(status, reason);
        let exit_reason = error.as_ref().map_or(ExitReason::Approved, LoopError::exit_reason);

        let result_branch = self.publish_result(&st, exit_reason).await;

        let input = SummaryInput {
            run: &st.run,
            target: &self.settings.target,
            iterations: &st.iterations,
            exit_reason,
            result_branch: result_branch.as_deref(),
            retained_workspaces: &st.retained,
        };
        let summary_md = if exit_reason == ExitReason::Approved {
            Some(finalizer::write_markdown(&self.reports, &input)?)
        } else {
            None
        };
        let summary_json = finalizer::write_json(&self.reports, &input)?;

        let mut end = Event::new(EventKind::RunEnd)
            .with_iteration(st.run.current_iteration)
            .with_status(st.run.status.as_str())
            .with_duration_ms(elapsed_ms(st.run.started_at))
            .with_artifact(&summary_json);
        if let Some(reason) = &st.run.reason {
            end = end.with_message(reason.clone());
        }
        st.record_event(&end);

        match &error {
            None => info!(run_id = %st.run.id, iterations = st.run.current_iteration, "run succeeded"),
            Some(err) => warn!(
                run_id = %st.run.id,
                status = st.run.status.as_str(),
                iterations = st.run.current_iteration,
                error = %err,
                "run ended without approval"
            ),
        }

        Ok(RunOutcome {
            run: st.run,
            iterations: st.iterations,
            finalizer: st.finalizer,
            exit_reason,
            error,
            result_branch,
            retained_workspaces: st.retained,
            summary_md,
            summary_json,
        })
    }

    async fn publish_result(&self, st: &RunState, exit_reason: ExitReason) -> Option<String> {
        if !matches!(exit_reason, ExitReason::Approved | ExitReason::BudgetExhausted)
            || st.seed.is_empty()
            || st.tip == st.seed
        {
            return None;
        }
        let workspaces = self.workspaces.clone();
        let repo = self.settings.base_repo.clone();
        let (seed, tip) = (st.seed.clone(), st.tip.clone());
        let branch = format!("{}{}", self.settings.result_branch_prefix, st.run.id);
        let publish_branch = branch.clone();
        let published = blocking(move || {
            if !workspaces.has_changes(&repo, &seed, &tip)? {
                return Ok(false);
            }
            workspaces.publish(&repo, &publish_branch, &tip)?;
            Ok::<_, WorkspaceError>(true)
        })
        .await
        .and_then(|published| published.map_err(LoopError::from));

        match published {
            Ok(true) => Some(branch),
            Ok(false) => {
                debug!(run_id = %st.run.id, "final tree matches the seed; no result branch");
                None
            }
            Err(err) => {
                warn!(run_id = %st.run.id, branch = %branch, error = %err, "failed to publish result branch");
                None
            }
        }
    }
}
