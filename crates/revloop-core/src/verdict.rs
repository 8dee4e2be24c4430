//! Verdict detection for validator output, plus severity tallies for reviews.
//!
//! The validator report ends with two marker lines:
//!
//! ```text
//! UNRESOLVED: critical=0 high=1 medium=2 low=0
//! VALIDATION: FAILED
//! ```
//!
//! The last `VALIDATION:` line decides approval. A report without one is
//! treated as not approved and flagged through [`Verdict::marker_found`].

use crate::types::{IssueCounts, Severity, Verdict};

pub const VALIDATION_MARKER: &str = "VALIDATION:";
pub const UNRESOLVED_MARKER: &str = "UNRESOLVED:";

/// Parse a validator report into a [`Verdict`].
///
/// # Example
/// ```
/// use revloop_core::verdict::parse_verdict;
///
/// let verdict = parse_verdict("All fixed.\nUNRESOLVED: critical=0 high=0 medium=1 low=0\nVALIDATION: PASSED\n");
/// assert!(verdict.approved);
/// assert_eq!(verdict.unresolved.medium, 1);
///
/// let verdict = parse_verdict("Looks fine to me.");
/// assert!(!verdict.approved);
/// assert!(!verdict.marker_found);
/// ```
pub fn parse_verdict(output: &str) -> Verdict {
    let decision = output.lines().filter_map(validation_decision).last();
    let unresolved = output
        .lines()
        .filter_map(unresolved_counts)
        .last()
        .unwrap_or_default();

    let mut verdict = Verdict {
        approved: decision.unwrap_or(false),
        unresolved,
        marker_found: decision.is_some(),
        overridden: None,
    };
    if verdict.unresolved.blocking() > 0 {
        verdict.withhold(format!(
            "validator passed with unresolved blocking issues ({})",
            verdict.unresolved
        ));
    }
    verdict
}

/// Strip markdown decoration around a marker line.
fn strip_decoration(line: &str) -> &str {
    line.trim()
        .trim_start_matches(['#', '>', '-', '*', '_', ' '])
        .trim_end_matches(['*', '_', ' ', '.'])
}

fn validation_decision(line: &str) -> Option<bool> {
    let line = strip_decoration(line);
    let rest = strip_prefix_ignore_case(line, VALIDATION_MARKER)?;
    let word = rest.trim().trim_matches(['*', '_', '`']).to_ascii_uppercase();
    if word.starts_with("PASSED") {
        Some(true)
    } else if word.starts_with("FAILED") {
        Some(false)
    } else {
        None
    }
}

fn unresolved_counts(line: &str) -> Option<IssueCounts> {
    let line = strip_decoration(line);
    let rest = strip_prefix_ignore_case(line, UNRESOLVED_MARKER)?;
    let mut counts = IssueCounts::default();
    let mut any = false;
    for token in rest.split([' ', ',', '\t']).filter(|t| !t.is_empty()) {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let severity = match key.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => continue,
        };
        if let Ok(n) = value.trim_matches(['*', '`']).parse::<u32>() {
            counts.add(severity, n);
            any = true;
        }
    }
    any.then_some(counts)
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

/// Count issues in a review report by severity marker.
///
/// A line counts once, under the most severe marker it carries. Recognised forms are
/// `CRITICAL:`, `[CRITICAL]`, `(CRITICAL)` and `**CRITICAL**`; bare mentions
/// such as "fix all CRITICAL issues" do not count.
pub fn tally_issues(report: &str) -> IssueCounts {
    let mut counts = IssueCounts::default();
    for line in report.lines() {
        if let Some(severity) = line_severity(line) {
            counts.add(severity, 1);
        }
    }
    counts
}

fn line_severity(line: &str) -> Option<Severity> {
    Severity::ALL.into_iter().find(|severity| {
        let marker = severity.marker();
        [
            format!("{marker}:"),
            format!("[{marker}]"),
            format!("({marker})"),
            format!("**{marker}**"),
        ]
        .iter()
        .any(|form| line.contains(form.as_str()))
    })
}
