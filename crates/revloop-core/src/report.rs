//! Per-stage report artifacts.
//!
//! Layout: `<runs_dir>/run-<run_id>/iter-NN-<slug>.md`. Reports are
//! write-once; the filename is the `(run, stage, iteration)` key.

use crate::types::{Report, RunId, StageRole};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("report already exists: {0}")]
    Conflict(PathBuf),
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// SHA-256 of `content`, lowercase hex.
pub fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Filename for a stage report, e.g. `iter-02-fix.md`.
pub fn report_file_name(role: StageRole, iteration: u32) -> String {
    format!("iter-{iteration:02}-{}.md", role.slug())
}

/// Inverse of [`report_file_name`].
fn parse_report_file_name(name: &str) -> Option<(u32, StageRole)> {
    let rest = name.strip_prefix("iter-")?.strip_suffix(".md")?;
    let (iteration, slug) = rest.split_once('-')?;
    Some((iteration.parse().ok()?, StageRole::from_slug(slug)?))
}

/// Filesystem-backed store of stage reports, keyed by run.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(format!("run-{run_id}"))
    }

    /// Create the run directory.
    pub fn init_run(&self, run_id: &RunId) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persist one stage report. A second write for the same key fails with
    /// [`ReportError::Conflict`] and leaves the first one untouched.
    pub fn append(
        &self,
        run_id: &RunId,
        role: StageRole,
        iteration: u32,
        content: &str,
    ) -> Result<Report> {
        let dir = self.init_run(run_id)?;
        let path = dir.join(report_file_name(role, iteration));
        write_once(&path, content.as_bytes())?;

        tracing::debug!(
            run_id = %run_id,
            role = role.as_str(),
            iteration,
            path = %path.display(),
            "report written"
        );

        Ok(Report {
            run_id: run_id.clone(),
            role,
            iteration,
            checksum: checksum(content.as_bytes()),
            path,
            content: content.to_string(),
        })
    }

    /// Read back one report, if it exists.
    pub fn get(&self, run_id: &RunId, role: StageRole, iteration: u32) -> Result<Option<Report>> {
        let path = self.run_dir(run_id).join(report_file_name(role, iteration));
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(Report {
                run_id: run_id.clone(),
                role,
                iteration,
                checksum: checksum(content.as_bytes()),
                path,
                content,
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// All reports of a run in chronological order (iteration, then stage).
    pub fn list(&self, run_id: &RunId) -> Result<Vec<Report>> {
        let dir = self.run_dir(run_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(parse_report_file_name) {
                keys.push(key);
            }
        }
        keys.sort_by_key(|(iteration, role)| (*iteration, role.order()));

        let mut reports = Vec::with_capacity(keys.len());
        for (iteration, role) in keys {
            if let Some(report) = self.get(run_id, role, iteration)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Concatenate every report with `iteration <= up_to_iteration`, each
    /// under a header naming its iteration, stage and file.
    ///
    /// Returns an empty string when there is nothing yet.
    pub fn aggregate(&self, run_id: &RunId, up_to_iteration: u32) -> Result<String> {
        let mut context = String::new();
        for report in self.list(run_id)? {
            if report.iteration > up_to_iteration {
                continue;
            }
            let file = report
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !context.is_empty() {
                context.push('\n');
            }
            context.push_str(&format!(
                "=== Iteration {} · {} ({file}) ===\n",
                report.iteration,
                report.role.slug()
            ));
            context.push_str(report.content.trim_end());
            context.push('\n');
        }
        Ok(context)
    }

    /// Write a run-level artifact such as `summary.md`, once.
    pub fn write_summary(&self, run_id: &RunId, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.init_run(run_id)?.join(name);
        write_once(&path, content.as_bytes())?;
        Ok(path)
    }
}

fn write_once(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(ReportError::Conflict(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ReportStore, RunId) {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());
        (dir, store, RunId::from_string("20261019T101500-abcd1234"))
    }

    #[test]
    fn run_dir_is_prefixed() {
        let store = ReportStore::new("/tmp/revloop");
        let dir = store.run_dir(&RunId::from_string("abc123"));
        assert_eq!(dir, PathBuf::from("/tmp/revloop/run-abc123"));
    }

    #[test]
    fn append_writes_named_file_with_checksum() {
        let (_dir, store, run_id) = store();
        let report = store
            .append(&run_id, StageRole::Reviewer, 1, "hello world")
            .unwrap();

        assert!(report.path.ends_with("run-20261019T101500-abcd1234/iter-01-review.md"));
        assert_eq!(fs::read_to_string(&report.path).unwrap(), "hello world");
        assert_eq!(
            report.checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn duplicate_append_conflicts() {
        let (_dir, store, run_id) = store();
        store.append(&run_id, StageRole::Developer, 1, "first").unwrap();

        let err = store
            .append(&run_id, StageRole::Developer, 1, "second")
            .unwrap_err();
        assert!(matches!(err, ReportError::Conflict(_)));

        let kept = store.get(&run_id, StageRole::Developer, 1).unwrap().unwrap();
        assert_eq!(kept.content, "first");

        store.append(&run_id, StageRole::Developer, 2, "next").unwrap();
    }

    #[test]
    fn list_orders_by_iteration_then_stage() {
        let (_dir, store, run_id) = store();
        store.append(&run_id, StageRole::Validator, 1, "v1").unwrap();
        store.append(&run_id, StageRole::Reviewer, 2, "r2").unwrap();
        store.append(&run_id, StageRole::Reviewer, 1, "r1").unwrap();
        store.append(&run_id, StageRole::Developer, 1, "f1").unwrap();
        store.append(&run_id, StageRole::Reviewer, 10, "r10").unwrap();

        let contents: Vec<_> = store
            .list(&run_id)
            .unwrap()
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, vec!["r1", "f1", "v1", "r2", "r10"]);
    }

    #[test]
    fn list_ignores_other_files() {
        let (_dir, store, run_id) = store();
        store.append(&run_id, StageRole::Reviewer, 1, "r1").unwrap();
        store.write_summary(&run_id, "summary.md", "done").unwrap();
        fs::write(store.run_dir(&run_id).join("iter-xx-review.md"), "junk").unwrap();

        assert_eq!(store.list(&run_id).unwrap().len(), 1);
    }

    #[test]
    fn aggregate_respects_iteration_bound() {
        let (_dir, store, run_id) = store();
        store.append(&run_id, StageRole::Reviewer, 1, "issue A\n").unwrap();
        store.append(&run_id, StageRole::Developer, 1, "fixed A").unwrap();
        store.append(&run_id, StageRole::Reviewer, 2, "issue B").unwrap();

        let context = store.aggregate(&run_id, 1).unwrap();
        assert!(context.starts_with("=== Iteration 1 · review (iter-01-review.md) ===\nissue A\n"));
        assert!(context.contains("=== Iteration 1 · fix (iter-01-fix.md) ===\nfixed A"));
        assert!(!context.contains("issue B"));

        let full = store.aggregate(&run_id, 2).unwrap();
        assert!(full.find("fixed A").unwrap() < full.find("issue B").unwrap());
    }

    #[test]
    fn aggregate_of_unknown_run_is_empty() {
        let (_dir, store, _) = store();
        let context = store.aggregate(&RunId::from_string("missing"), 3).unwrap();
        assert!(context.is_empty());
    }

    #[test]
    fn summary_is_write_once() {
        let (_dir, store, run_id) = store();
        store.write_summary(&run_id, "summary.md", "a").unwrap();
        assert!(matches!(
            store.write_summary(&run_id, "summary.md", "b"),
            Err(ReportError::Conflict(_))
        ));
    }
}
