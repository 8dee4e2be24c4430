//! `events.tsv`: an append-only event ledger per run.
//!
//! Columns: `timestamp_ms`, kind, iteration, role, status, `duration_ms`,
//! `exit_code`, `output_bytes`, `artifact_path`, message

use crate::types::StageRole;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const LEDGER_FILE: &str = "events.tsv";

const HEADER: &str = "timestamp_ms\tkind\titeration\trole\tstatus\tduration_ms\texit_code\toutput_bytes\tartifact_path\tmessage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RunStart,
    StageStart,
    StageEnd,
    RunEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "RUN_START",
            Self::StageStart => "STAGE_START",
            Self::StageEnd => "STAGE_END",
            Self::RunEnd => "RUN_END",
        }
    }
}

/// One ledger row. Unset optional columns render empty.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp_ms: i64,
    pub kind: EventKind,
    pub iteration: Option<u32>,
    pub role: Option<StageRole>,
    pub status: Option<String>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub output_bytes: Option<u64>,
    pub artifact_path: Option<String>,
    pub message: String,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self::at(chrono::Utc::now().timestamp_millis(), kind)
    }

    pub fn at(timestamp_ms: i64, kind: EventKind) -> Self {
        Self {
            timestamp_ms,
            kind,
            iteration: None,
            role: None,
            status: None,
            duration_ms: None,
            exit_code: None,
            output_bytes: None,
            artifact_path: None,
            message: String::new(),
        }
    }

    pub fn with_stage(mut self, role: StageRole, iteration: u32) -> Self {
        self.role = Some(role);
        self.iteration = Some(iteration);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_output_bytes(mut self, bytes: u64) -> Self {
        self.output_bytes = Some(bytes);
        self
    }

    pub fn with_artifact(mut self, path: &Path) -> Self {
        self.artifact_path = Some(path.display().to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn to_tsv_line(&self) -> String {
        fn opt<T: ToString>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }

        [
            self.timestamp_ms.to_string(),
            self.kind.as_str().to_string(),
            opt(self.iteration),
            opt(self.role.map(|r| r.as_str())),
            sanitize_field(self.status.as_deref().unwrap_or("")),
            opt(self.duration_ms),
            opt(self.exit_code),
            opt(self.output_bytes),
            sanitize_field(self.artifact_path.as_deref().unwrap_or("")),
            sanitize_field(&self.message),
        ]
        .join("\t")
    }
}

fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// Appends rows to `events.tsv`, writing the header when the file is new.
///
/// Every row is flushed immediately so the ledger survives an abort.
pub struct Ledger {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            writeln!(writer, "{HEADER}")?;
        }
        Ok(Self { writer })
    }

    /// Open the ledger inside a run directory.
    pub fn in_run_dir(run_dir: &Path) -> std::io::Result<Self> {
        Self::open(&run_dir.join(LEDGER_FILE))
    }

    pub fn record(&mut self, event: &Event) -> std::io::Result<()> {
        writeln!(self.writer, "{}", event.to_tsv_line())?;
        self.writer.flush()
    }
}
