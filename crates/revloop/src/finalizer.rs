//! Run summaries: `summary.md` for approved runs, `summary.json` for every run.

use revloop_core::report::{ReportError, ReportStore};
use revloop_core::verdict::tally_issues;
use revloop_core::{IssueCounts, Iteration, Report, Run, RunStatus, StageRole, Verdict};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SUMMARY_MD: &str = "summary.md";
pub const SUMMARY_JSON: &str = "summary.json";

/// Lines of each development report quoted in the summary.
const EXCERPT_LINES: usize = 20;
const EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FinalizeError>;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Approved,
    BudgetExhausted,
    Cancelled,
    Error,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Approved => crate::EXIT_OK,
            Self::BudgetExhausted => crate::EXIT_BUDGET_EXHAUSTED,
            Self::Cancelled | Self::Error => crate::EXIT_INTERNAL,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub iteration: u32,
    pub role: StageRole,
    pub path: PathBuf,
    pub checksum: String,
}

/// `summary.json` schema.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub run_id: String,
    pub target: &'a str,
    pub status: RunStatus,
    pub exit_reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: i64,
    pub max_iterations: u32,
    pub iterations_run: u32,
    /// Severity tallies over every review report.
    pub issues_found: IssueCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<&'a Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_branch: Option<&'a str>,
    pub retained_workspaces: &'a [PathBuf],
    pub reports: Vec<ReportEntry>,
    pub iterations: &'a [Iteration],
}

/// Everything a summary is built from.
#[derive(Debug, Clone, Copy)]
pub struct SummaryInput<'a> {
    pub run: &'a Run,
    pub target: &'a str,
    pub iterations: &'a [Iteration],
    pub exit_reason: ExitReason,
    pub result_branch: Option<&'a str>,
    pub retained_workspaces: &'a [PathBuf],
}

impl SummaryInput<'_> {
    fn last_verdict(&self) -> Option<&Verdict> {
        self.iterations.iter().rev().find_map(|it| it.verdict.as_ref())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn excerpt(content: &str) -> String {
    let mut out = String::new();
    let mut truncated = false;
    for (index, line) in content.trim().lines().enumerate() {
        if index >= EXCERPT_LINES || out.chars().count() + line.chars().count() > EXCERPT_CHARS {
            truncated = true;
            break;
        }
        out.push_str("> ");
        out.push_str(line);
        out.push('\n');
    }
    if out.is_empty() && !truncated {
        out.push_str("> (empty report)\n");
    }
    if truncated {
        out.push_str(">\n> (truncated; see the full report)\n");
    }
    out
}

/// Render `summary.md`.
pub fn render_markdown(input: &SummaryInput<'_>, reports: &[Report]) -> String {
    let run = input.run;
    let mut md = String::new();

    md.push_str("# Review Loop Summary\n\n");
    md.push_str(&format!("- Run: `{}`\n", run.id));
    md.push_str(&format!("- Target: `{}`\n", input.target));
    md.push_str(&format!(
        "- Iterations: {} of {}\n",
        run.current_iteration, run.max_iterations
    ));
    md.push_str(&format!("- Outcome: {}\n", input.exit_reason.as_str()));
    if let Some(branch) = input.result_branch {
        md.push_str(&format!("- Result branch: `{branch}`\n"));
    }

    md.push_str("\n## Issues found\n\n");
    md.push_str("| Iteration | Critical | High | Medium | Low | Report |\n");
    md.push_str("|---|---|---|---|---|---|\n");
    let mut total = IssueCounts::default();
    for report in reports.iter().filter(|r| r.role == StageRole::Reviewer) {
        let counts = tally_issues(&report.content);
        total.merge(&counts);
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            report.iteration,
            counts.critical,
            counts.high,
            counts.medium,
            counts.low,
            file_name(&report.path)
        ));
    }
    md.push_str(&format!(
        "| **Total** | {} | {} | {} | {} | |\n",
        total.critical, total.high, total.medium, total.low
    ));

    md.push_str("\n## Fixes applied\n");
    for report in reports.iter().filter(|r| r.role == StageRole::Developer) {
        md.push_str(&format!(
            "\n### Iteration {} ({})\n\n",
            report.iteration,
            file_name(&report.path)
        ));
        md.push_str(&excerpt(&report.content));
    }

    md.push_str("\n## Validation\n\n");
    for iteration in input.iterations {
        let file = reports
            .iter()
            .find(|r| r.role == StageRole::Validator && r.iteration == iteration.index)
            .map(|r| file_name(&r.path))
            .unwrap_or_default();
        let verdict = iteration
            .verdict
            .as_ref()
            .map_or_else(|| "no verdict".to_string(), ToString::to_string);
        md.push_str(&format!("- Iteration {} ({file}): {verdict}\n", iteration.index));
    }

    md.push_str("\n## Residual risk\n\n");
    match input.last_verdict() {
        Some(verdict) if verdict.unresolved.total() > 0 => {
            md.push_str(&format!(
                "The validator left {} issue(s) unresolved ({}). None of them block approval, \
                 but they should be tracked.\n",
                verdict.unresolved.total(),
                verdict.unresolved
            ));
        }
        Some(_) => md.push_str("The validator reported no unresolved issues.\n"),
        None => md.push_str("No verdict was recorded.\n"),
    }

    if let Some(notes) = reports.iter().find(|r| r.role == StageRole::Finalizer) {
        md.push_str(&format!("\n## Finalizer notes ({})\n\n", file_name(&notes.path)));
        md.push_str(notes.content.trim());
        md.push('\n');
    }

    md.push_str("\n## Reports\n\n");
    for report in reports {
        md.push_str(&format!("- `{}`\n", file_name(&report.path)));
    }
    md
}

/// Write `summary.md` from everything stored for the run.
pub fn write_markdown(store: &ReportStore, input: &SummaryInput<'_>) -> Result<PathBuf> {
    let reports = store.list(&input.run.id)?;
    let content = render_markdown(input, &reports);
    Ok(store.write_summary(&input.run.id, SUMMARY_MD, &content)?)
}

/// Write `summary.json`.
pub fn write_json(store: &ReportStore, input: &SummaryInput<'_>) -> Result<PathBuf> {
    let run = input.run;
    let reports = store.list(&run.id)?;

    let mut issues_found = IssueCounts::default();
    for report in reports.iter().filter(|r| r.role == StageRole::Reviewer) {
        issues_found.merge(&tally_issues(&report.content));
    }

    let ended = run.ended_at.unwrap_or_else(chrono::Utc::now);
    let summary = RunSummary {
        run_id: run.id.to_string(),
        target: input.target,
        status: run.status,
        exit_reason: input.exit_reason,
        reason: run.reason.as_deref(),
        started_at: run.started_at,
        ended_at: run.ended_at,
        duration_ms: (ended - run.started_at).num_milliseconds(),
        max_iterations: run.max_iterations,
        iterations_run: run.current_iteration,
        issues_found,
        last_verdict: input.last_verdict(),
        result_branch: input.result_branch,
        retained_workspaces: input.retained_workspaces,
        reports: reports
            .iter()
            .map(|r| ReportEntry {
                iteration: r.iteration,
                role: r.role,
                path: r.path.clone(),
                checksum: r.checksum.clone(),
            })
            .collect(),
        iterations: input.iterations,
    };

    let json = serde_json::to_string_pretty(&summary)?;
    Ok(store.write_summary(&run.id, SUMMARY_JSON, &json)?)
}
