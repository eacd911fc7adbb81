//! Reading JSONL leak reports back.
//!
//! A report file accumulates one block per leak check (the `leak` records followed
//! by a `summary`), so a single run can append several blocks.

use std::fmt;
use std::path::Path;

use leakshim_core::engine::report::{
    EVENT_LEAK, EVENT_SUMMARY, LeakLogEntry, ReportLineError, validate_report_line,
};
use serde::Serialize;

use crate::HarnessError;

/// Totals over a report file. Byte and object counts come from the last summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportDigest {
    pub lines: usize,
    pub leak_records: usize,
    pub summaries: usize,
    pub leaked_bytes: usize,
    pub leaked_objects: usize,
    pub exit_code: Option<i32>,
}

impl ReportDigest {
    fn absorb(&mut self, entry: &LeakLogEntry) {
        self.lines += 1;
        match entry.event.as_str() {
            EVENT_LEAK => self.leak_records += 1,
            EVENT_SUMMARY => {
                self.summaries += 1;
                self.leaked_bytes = entry.bytes.unwrap_or(0);
                self.leaked_objects = entry.objects.unwrap_or(0);
                self.exit_code = entry.exit_code;
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn has_leaks(&self) -> bool {
        self.leaked_objects > 0
    }
}

impl fmt::Display for ReportDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} record(s), {} leak group(s) over {} check(s); last check: {} byte(s) in {} object(s)",
            self.lines, self.leak_records, self.summaries, self.leaked_bytes, self.leaked_objects
        )?;
        if let Some(code) = self.exit_code {
            write!(f, ", exit code {code}")?;
        }
        Ok(())
    }
}

/// Validate every non-blank line and summarize. Returns all schema errors found.
pub fn digest_str(text: &str) -> Result<ReportDigest, Vec<ReportLineError>> {
    let mut digest = ReportDigest::default();
    let mut errors = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match validate_report_line(line, idx + 1) {
            Ok(entry) => digest.absorb(&entry),
            Err(mut errs) => errors.append(&mut errs),
        }
    }
    if errors.is_empty() {
        Ok(digest)
    } else {
        Err(errors)
    }
}

pub fn digest_file(path: &Path) -> Result<ReportDigest, HarnessError> {
    let text = std::fs::read_to_string(path)?;
    digest_str(&text).map_err(|errors| HarnessError::InvalidReport {
        path: path.to_path_buf(),
        count: errors.len(),
        first: errors.first().map(ToString::to_string).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAK: &str = r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"leakshim::1::001","level":"error","event":"leak","bytes":64,"objects":2,"thread_id":0,"frames":["0x401000","0x401200"]}"#;
    const SUMMARY: &str = r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"leakshim::1::summary","level":"error","event":"summary","bytes":64,"objects":2,"groups":1,"exit_code":23}"#;

    #[test]
    fn digest_counts_records_and_takes_last_summary() {
        let clean = r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"leakshim::1::summary","level":"info","event":"summary","bytes":0,"objects":0,"groups":0}"#;
        let text = format!("{LEAK}\n{SUMMARY}\n\n{clean}\n");
        let digest = digest_str(&text).unwrap();
        assert_eq!(digest.lines, 3);
        assert_eq!(digest.leak_records, 1);
        assert_eq!(digest.summaries, 2);
        assert_eq!(digest.leaked_bytes, 0);
        assert_eq!(digest.exit_code, None);
        assert!(!digest.has_leaks());
    }

    #[test]
    fn leaky_digest_renders_exit_code() {
        let digest = digest_str(&format!("{LEAK}\n{SUMMARY}")).unwrap();
        assert!(digest.has_leaks());
        let text = digest.to_string();
        assert!(text.contains("64 byte(s) in 2 object(s)"), "{text}");
        assert!(text.ends_with("exit code 23"), "{text}");
    }

    #[test]
    fn every_bad_line_is_reported() {
        let text = format!("not json\n{LEAK}\n{{\"event\":\"leak\"}}\n");
        let errors = digest_str(&text).unwrap_err();
        assert!(errors.iter().any(|e| e.line_number == 1));
        assert!(errors.iter().any(|e| e.line_number == 3 && e.field == "timestamp"));
        assert!(errors.iter().all(|e| e.line_number != 2));
    }
}
