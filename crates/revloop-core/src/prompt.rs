//! Prompt assembly for each stage role.
//!
//! Prompts embed prior reports verbatim, so they routinely exceed what is
//! safe to pass inline; the runner decides how to deliver them.

use crate::types::StageRole;
use crate::verdict::{UNRESOLVED_MARKER, VALIDATION_MARKER};

/// Inputs shared by every stage prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Revision under review, as given on the command line.
    pub target: String,
    /// Branch the changes are compared against.
    pub base_branch: String,
    /// Revision that replaces `base_branch` as the comparison point, such as
    /// the target's parent when only its last commit is reviewed.
    pub compare_base: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Aggregated reports from earlier iterations.
    pub prior_context: String,
    /// This iteration's review report.
    pub review: Option<String>,
    /// This iteration's development report.
    pub development: Option<String>,
}

impl PromptContext {
    fn comparison(&self) -> &str {
        self.compare_base.as_deref().unwrap_or(&self.base_branch)
    }

    fn diff_command(&self) -> String {
        format!("git diff {}...HEAD", self.comparison())
    }

    fn header(&self, role: StageRole) -> String {
        format!(
            "You are the {} in an automated review loop (iteration {} of {}).\n\
             The working directory is a private checkout of `{}`; changes relative to `{}` are under review.\n",
            role.title().to_lowercase(),
            self.iteration,
            self.max_iterations,
            self.target,
            self.comparison(),
        )
    }
}

/// Build the prompt for `role`.
pub fn build(role: StageRole, ctx: &PromptContext) -> String {
    match role {
        StageRole::Reviewer => review_prompt(ctx),
        StageRole::Developer => fix_prompt(ctx),
        StageRole::Validator => validate_prompt(ctx),
        StageRole::Finalizer => finalize_prompt(ctx),
    }
}

fn push_section(prompt: &mut String, title: &str, body: &str) {
    prompt.push_str("\n## ");
    prompt.push_str(title);
    prompt.push_str("\n\n");
    prompt.push_str(body.trim_end());
    prompt.push('\n');
}

pub fn review_prompt(ctx: &PromptContext) -> String {
    let mut prompt = ctx.header(StageRole::Reviewer);
    prompt.push_str(&format!(
        "
Inspect the changes with `{diff}` and review them for correctness, error handling,
input validation, security, performance, and test coverage.

Tag every issue with exactly one severity marker at the start of its line:
`CRITICAL:`, `HIGH:`, `MEDIUM:` or `LOW:`. Give the file and line, explain the
problem, and propose a concrete fix.

Structure the report as: Summary, Issues (grouped by severity), Recommendations.
Do not modify any files in this stage.
",
        diff = ctx.diff_command()
    ));
    if !ctx.prior_context.is_empty() {
        push_section(
            &mut prompt,
            "Earlier iterations",
            &format!(
                "Reports from previous iterations follow. Confirm whether earlier issues were \
                 really fixed and look for regressions introduced by those fixes.\n\n{}",
                ctx.prior_context
            ),
        );
    }
    prompt
}

pub fn fix_prompt(ctx: &PromptContext) -> String {
    let mut prompt = ctx.header(StageRole::Developer);
    prompt.push_str(&format!(
        "
Fix every CRITICAL and HIGH issue from the review below, and MEDIUM issues where the
fix is low risk. Edit files in the working directory directly; run the project's
tests after your changes. Use `{diff}` to see the current state.

Structure the report as: Summary, Issues Fixed (one entry per issue with its
severity marker), Test Results, Remaining Work.
",
        diff = ctx.diff_command()
    ));
    push_section(
        &mut prompt,
        "Review report",
        ctx.review.as_deref().unwrap_or("(the review stage produced no report)"),
    );
    if !ctx.prior_context.is_empty() {
        push_section(&mut prompt, "Earlier iterations", &ctx.prior_context);
    }
    prompt
}

pub fn validate_prompt(ctx: &PromptContext) -> String {
    let mut prompt = ctx.header(StageRole::Validator);
    prompt.push_str(&format!(
        "
Verify the developer's work. Read the review and development reports below, inspect
`{diff}`, and run the tests. Check that each CRITICAL and HIGH issue is actually
fixed and that the fixes introduced no new problems. Do not modify any files.

Structure the report as: Summary, Issue Assessment (one entry per reviewed issue),
Test Results, Conclusion.

The report MUST end with exactly these two lines, filling in the real number of
issues that remain unresolved and a single verdict word:

{unresolved} critical=<n> high=<n> medium=<n> low=<n>
{validation} <PASSED or FAILED>

Answer PASSED only if no CRITICAL or HIGH issue remains and the tests pass.
Any new issue introduced by the fixes counts as remaining.
",
        diff = ctx.diff_command(),
        unresolved = UNRESOLVED_MARKER,
        validation = VALIDATION_MARKER,
    ));
    push_section(
        &mut prompt,
        "Review report",
        ctx.review.as_deref().unwrap_or("(the review stage produced no report)"),
    );
    push_section(
        &mut prompt,
        "Development report",
        ctx.development
            .as_deref()
            .unwrap_or("(the fix stage produced no report)"),
    );
    prompt
}

pub fn finalize_prompt(ctx: &PromptContext) -> String {
    let mut prompt = ctx.header(StageRole::Finalizer);
    prompt.push_str(
        "
Validation has passed. Using the full history below, write a change summary suitable
for a pull request description: what was reviewed, which issues were found, how each
was fixed, and any residual risk. Do not modify any files.
",
    );
    push_section(&mut prompt, "Run history", &ctx.prior_context);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::parse_verdict;

    fn ctx() -> PromptContext {
        PromptContext {
            target: "feature/login".to_string(),
            base_branch: "main".to_string(),
            iteration: 2,
            max_iterations: 3,
            ..PromptContext::default()
        }
    }

    #[test]
    fn header_names_role_and_iteration() {
        let prompt = build(StageRole::Reviewer, &ctx());
        assert!(prompt.starts_with("You are the reviewer"));
        assert!(prompt.contains("iteration 2 of 3"));
        assert!(prompt.contains("git diff main...HEAD"));
    }

    #[test]
    fn compare_base_replaces_base_branch() {
        let mut ctx = ctx();
        ctx.compare_base = Some("4b825dc6".to_string());
        let prompt = build(StageRole::Reviewer, &ctx);
        assert!(prompt.contains("git diff 4b825dc6...HEAD"));
        assert!(prompt.contains("changes relative to `4b825dc6`"));
        assert!(!prompt.contains("main...HEAD"));
    }

    #[test]
    fn review_prompt_includes_prior_context_only_when_present() {
        let mut ctx = ctx();
        assert!(!review_prompt(&ctx).contains("Earlier iterations"));

        ctx.prior_context = "=== Iteration 1 · review ===\nHIGH: leak".to_string();
        let prompt = review_prompt(&ctx);
        assert!(prompt.contains("## Earlier iterations"));
        assert!(prompt.contains("HIGH: leak"));
    }

    #[test]
    fn fix_prompt_embeds_review() {
        let mut ctx = ctx();
        ctx.review = Some("CRITICAL: sql injection in login.rs:42".to_string());
        let prompt = build(StageRole::Developer, &ctx);
        assert!(prompt.contains("## Review report"));
        assert!(prompt.contains("sql injection"));
    }

    #[test]
    fn validate_prompt_demands_markers() {
        let mut ctx = ctx();
        ctx.review = Some("review body".to_string());
        ctx.development = Some("dev body".to_string());
        let prompt = build(StageRole::Validator, &ctx);
        assert!(prompt.contains("UNRESOLVED: critical=<n> high=<n> medium=<n> low=<n>"));
        assert!(prompt.contains("VALIDATION: <PASSED or FAILED>"));
        assert!(prompt.contains("review body"));
        assert!(prompt.contains("dev body"));
    }

    #[test]
    fn validate_prompt_is_not_itself_a_verdict() {
        let mut ctx = ctx();
        ctx.review = Some("r".to_string());
        ctx.development = Some("d".to_string());
        let prompt = validate_prompt(&ctx);
        // An agent that echoes the prompt back must not be approved by it.
        assert!(!parse_verdict(&prompt).approved);
    }

    #[test]
    fn missing_reports_are_called_out() {
        let prompt = validate_prompt(&ctx());
        assert!(prompt.contains("(the review stage produced no report)"));
        assert!(prompt.contains("(the fix stage produced no report)"));
    }
}
