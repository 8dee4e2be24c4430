pub mod config;
pub mod ledger;
pub mod prompt;
pub mod report;
pub mod types;
pub mod verdict;

pub use config::Config;
pub use ledger::{Event, EventKind, Ledger};
pub use report::{ReportError, ReportStore};
pub use types::*;
