//! Core types for the review loop.
//!
//! Runs, iterations, stages, reports and verdicts. Only the loop controller
//! mutates a [`Run`]; everything else reads snapshots of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a run.
///
/// Timestamp-derived (`20261019T101500-1a2b3c4d`) so run directories sort by
/// start time; the random suffix keeps runs started in the same second apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(started: DateTime<Utc>) -> Self {
        let random = Uuid::now_v7().simple().to_string();
        let suffix = &random[random.len() - 8..];
        Self(format!("{}-{suffix}", started.format("%Y%m%dT%H%M%S")))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// The agent role a stage runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Reviewer,
    Developer,
    Validator,
    Finalizer,
}

impl StageRole {
    /// Pipeline order within one iteration.
    pub const PIPELINE: [StageRole; 3] = [Self::Reviewer, Self::Developer, Self::Validator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reviewer => "reviewer",
            Self::Developer => "developer",
            Self::Validator => "validator",
            Self::Finalizer => "finalizer",
        }
    }

    /// Short slug for artifact filenames (e.g., iter-01-review.md).
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Reviewer => "review",
            Self::Developer => "fix",
            Self::Validator => "validate",
            Self::Finalizer => "finalize",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "review" => Some(Self::Reviewer),
            "fix" => Some(Self::Developer),
            "validate" => Some(Self::Validator),
            "finalize" => Some(Self::Finalizer),
            _ => None,
        }
    }

    /// Heading used in report bodies ("Reviewer Report").
    pub fn title(&self) -> &'static str {
        match self {
            Self::Reviewer => "Reviewer",
            Self::Developer => "Developer",
            Self::Validator => "Validator",
            Self::Finalizer => "Finalizer",
        }
    }

    /// Position used to order reports written in the same iteration.
    pub fn order(&self) -> u8 {
        match self {
            Self::Reviewer => 0,
            Self::Developer => 1,
            Self::Validator => 2,
            Self::Finalizer => 3,
        }
    }
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    TimedOut,
    Failed,
    /// Interrupted by an external cancellation signal.
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Issue severity as used by the reviewer and validator prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Uppercase marker as it appears in agent output.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

/// How a prompt reached the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptDelivery {
    /// Passed as a single argv element.
    #[default]
    Inline,
    /// Written to a scoped temporary file whose path was passed instead.
    File,
}

// --- Records ---

/// Issue counts keyed by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl IssueCounts {
    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    pub fn add(&mut self, severity: Severity, n: u32) {
        let slot = match severity {
            Severity::Critical => &mut self.critical,
            Severity::High => &mut self.high,
            Severity::Medium => &mut self.medium,
            Severity::Low => &mut self.low,
        };
        *slot = slot.saturating_add(n);
    }

    pub fn merge(&mut self, other: &IssueCounts) {
        for severity in Severity::ALL {
            self.add(severity, other.get(severity));
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }

    /// Critical and high issues, the ones that block approval.
    pub fn blocking(&self) -> u32 {
        self.critical + self.high
    }
}

impl std::fmt::Display for IssueCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "critical={} high={} medium={} low={}",
            self.critical, self.high, self.medium, self.low
        )
    }
}

/// Structured outcome of a validator stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    pub unresolved: IssueCounts,
    /// Whether a `VALIDATION:` marker was present at all.
    pub marker_found: bool,
    /// Why approval was withheld despite the validator's marker, if it was.
    pub overridden: Option<String>,
}

impl Verdict {
    pub fn rejected(unresolved: IssueCounts) -> Self {
        Self {
            approved: false,
            unresolved,
            marker_found: true,
            overridden: None,
        }
    }

    pub fn approved() -> Self {
        Self {
            approved: true,
            unresolved: IssueCounts::default(),
            marker_found: true,
            overridden: None,
        }
    }

    /// Withhold approval because an earlier stage of the iteration failed.
    pub fn withhold(&mut self, reason: impl Into<String>) {
        if self.approved {
            self.approved = false;
            self.overridden = Some(reason.into());
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.approved { "approved" } else { "rejected" };
        write!(f, "{state} (unresolved: {})", self.unresolved)?;
        if !self.marker_found {
            write!(f, " [no VALIDATION marker]")?;
        }
        if let Some(reason) = &self.overridden {
            write!(f, " [withheld: {reason}]")?;
        }
        Ok(())
    }
}

/// A single run of the review loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Artifact directory for this run.
    pub root_dir: PathBuf,
    pub max_iterations: u32,
    /// 0 before the first iteration starts.
    pub current_iteration: u32,
    pub status: RunStatus,
    /// Terminal reason, set together with a terminal status.
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: RunId, root_dir: PathBuf, max_iterations: u32) -> Self {
        Self {
            id,
            root_dir,
            max_iterations,
            current_iteration: 0,
            status: RunStatus::InProgress,
            reason: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Advance to the next iteration, returning its index.
    pub fn next_iteration(&mut self) -> u32 {
        self.current_iteration += 1;
        self.current_iteration
    }

    /// Move into a terminal status.
    ///
    /// Returns `false` (and changes nothing) if the run is already terminal or
    /// `status` is not terminal.
    pub fn terminate(&mut self, status: RunStatus, reason: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.reason = reason;
        self.ended_at = Some(Utc::now());
        true
    }
}

/// One agent invocation within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub role: StageRole,
    pub iteration: u32,
    pub workspace_label: String,
    pub workspace_path: PathBuf,
    /// Length of the prompt in characters.
    pub prompt_chars: usize,
    pub prompt_delivery: PromptDelivery,
    /// Temp file used for delivery; removed by the time the stage ends.
    pub prompt_file: Option<PathBuf>,
    pub timeout_sec: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub status: StageStatus,
    pub report_path: Option<PathBuf>,
    /// Failure description (timeout, exit code, cancellation).
    pub error: Option<String>,
}

impl Stage {
    pub fn pending(role: StageRole, iteration: u32, timeout_sec: u64) -> Self {
        Self {
            role,
            iteration,
            workspace_label: String::new(),
            workspace_path: PathBuf::new(),
            prompt_chars: 0,
            prompt_delivery: PromptDelivery::Inline,
            prompt_file: None,
            timeout_sec,
            started_at: None,
            ended_at: None,
            exit_code: None,
            status: StageStatus::Pending,
            report_path: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

/// One Review → Fix → Validate cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub review: Option<Stage>,
    pub fix: Option<Stage>,
    pub validate: Option<Stage>,
    pub verdict: Option<Verdict>,
}

impl Iteration {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            review: None,
            fix: None,
            validate: None,
            verdict: None,
        }
    }

    pub fn stage(&self, role: StageRole) -> Option<&Stage> {
        match role {
            StageRole::Reviewer => self.review.as_ref(),
            StageRole::Developer => self.fix.as_ref(),
            StageRole::Validator => self.validate.as_ref(),
            StageRole::Finalizer => None,
        }
    }

    pub fn record(&mut self, stage: Stage) {
        match stage.role {
            StageRole::Reviewer => self.review = Some(stage),
            StageRole::Developer => self.fix = Some(stage),
            StageRole::Validator => self.validate = Some(stage),
            StageRole::Finalizer => {}
        }
    }

    /// All three pipeline stages ran and a verdict exists.
    pub fn is_complete(&self) -> bool {
        self.review.is_some() && self.fix.is_some() && self.validate.is_some() && self.verdict.is_some()
    }

    /// Failures from stages before validation, which withhold approval.
    pub fn upstream_failures(&self) -> Vec<String> {
        [&self.review, &self.fix]
            .into_iter()
            .flatten()
            .filter(|stage| !stage.succeeded())
            .map(|stage| {
                format!(
                    "{} stage {}",
                    stage.role,
                    stage.error.as_deref().unwrap_or(stage.status.as_str())
                )
            })
            .collect()
    }
}

/// An immutable per-stage artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: RunId,
    pub role: StageRole,
    pub iteration: u32,
    pub path: PathBuf,
    /// SHA-256 of the content.
    pub checksum: String,
    pub content: String,
}
