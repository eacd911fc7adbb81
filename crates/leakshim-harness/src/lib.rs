//! Tooling around the leakshim preload library.
//!
//! - [`launcher`]: run a program with the shim preloaded and configured
//! - [`report_file`]: read back and validate the JSONL leak report

#![forbid(unsafe_code)]

pub mod launcher;
pub mod report_file;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("shim library not found: {}", .0.display())]
    ShimNotFound(PathBuf),
    #[error("no program given")]
    MissingProgram,
    #[error("{}: {count} schema error(s), first: {first}", .path.display())]
    InvalidReport {
        path: PathBuf,
        count: usize,
        first: String,
    },
}

pub use launcher::{LaunchOutcome, Launcher};
pub use report_file::ReportDigest;
