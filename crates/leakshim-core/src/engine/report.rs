//! Leak report: grouping, text rendering, and the JSONL structured log.
//!
//! Two outputs are produced by a leak check:
//! - a human-readable report on stderr, grouped by allocation call-site;
//! - optionally, a JSONL file with one `leak` record per group and one `summary`
//!   record. Required fields are `timestamp`, `trace_id`, `level` and `event`;
//!   optional fields are omitted when absent.
//!
//! Rendering allocates and symbolizes; it only runs from the leak check, under the
//! reentrancy guard.

use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::callsite::{CallSite, FrameInfo};
use crate::engine::{LiveAllocation, ThreadId};

/// Leaked blocks sharing one allocation call-site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakGroup {
    pub trace: CallSite,
    pub total_bytes: usize,
    pub objects: usize,
    /// Owner of the first block seen for this call-site.
    pub owner: ThreadId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakSummary {
    /// Sorted by `total_bytes`, largest first.
    pub groups: Vec<LeakGroup>,
    pub leaked_bytes: usize,
    pub leaked_objects: usize,
}

impl LeakSummary {
    /// Group the reportable (non-ignored) allocations by call-site.
    #[must_use]
    pub fn from_allocations(allocations: impl IntoIterator<Item = LiveAllocation>) -> Self {
        let mut by_site: HashMap<u64, LeakGroup> = HashMap::new();
        let mut summary = Self::default();
        for alloc in allocations.into_iter().filter(|a| !a.ignored) {
            summary.leaked_bytes += alloc.size;
            summary.leaked_objects += 1;
            by_site
                .entry(alloc.trace.fingerprint())
                .and_modify(|g| {
                    g.total_bytes += alloc.size;
                    g.objects += 1;
                })
                .or_insert(LeakGroup {
                    trace: alloc.trace,
                    total_bytes: alloc.size,
                    objects: 1,
                    owner: alloc.owner,
                });
        }
        summary.groups = by_site.into_values().collect();
        summary.groups.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then(b.objects.cmp(&a.objects))
                .then(a.trace.frames().cmp(b.trace.frames()))
        });
        summary
    }

    #[must_use]
    pub fn has_leaks(&self) -> bool {
        self.leaked_objects > 0
    }
}

// ---------------------------------------------------------------------------
// Text report
// ---------------------------------------------------------------------------

/// Render the stderr report. `max_groups == 0` prints every group.
pub fn render_text<W, S>(
    summary: &LeakSummary,
    pid: u32,
    max_groups: usize,
    out: &mut W,
    mut symbolize: S,
) -> fmt::Result
where
    W: fmt::Write,
    S: FnMut(usize) -> Option<FrameInfo>,
{
    if !summary.has_leaks() {
        return Ok(());
    }
    writeln!(out, "=================================================================")?;
    writeln!(out, "=={pid}==ERROR: leakshim: detected memory leaks")?;
    let shown = if max_groups == 0 {
        summary.groups.len()
    } else {
        max_groups.min(summary.groups.len())
    };
    for group in &summary.groups[..shown] {
        writeln!(out)?;
        writeln!(
            out,
            "Direct leak of {} byte(s) in {} object(s) allocated from thread {}:",
            group.total_bytes, group.objects, group.owner
        )?;
        if group.trace.is_empty() {
            writeln!(out, "    <call-site not captured>")?;
        }
        for (i, &ip) in group.trace.frames().iter().enumerate() {
            write!(out, "    #{i} {ip:#x}")?;
            if let Some(frame) = symbolize(ip) {
                if let Some(function) = &frame.function {
                    write!(out, " in {function}")?;
                }
                if let Some(file) = &frame.file {
                    write!(out, " {file}")?;
                    if let Some(line) = frame.line {
                        write!(out, ":{line}")?;
                    }
                }
            }
            writeln!(out)?;
        }
    }
    if shown < summary.groups.len() {
        writeln!(out)?;
        writeln!(
            out,
            "The {} top leak(s) are shown; {} more omitted.",
            shown,
            summary.groups.len() - shown
        )?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "SUMMARY: leakshim: {} byte(s) leaked in {} allocation(s).",
        summary.leaked_bytes, summary.leaked_objects
    )
}

// ---------------------------------------------------------------------------
// Structured log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

pub const EVENT_LEAK: &str = "leak";
pub const EVENT_SUMMARY: &str = "summary";

/// One JSONL record of a leak report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakLogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u32>,
    /// Hex return addresses, innermost first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl LeakLogEntry {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            bytes: None,
            objects: None,
            thread_id: None,
            frames: None,
            groups: None,
            exit_code: None,
        }
    }

    /// Serialize as one JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Build the records for one leak check: a `leak` record per group, then a
/// `summary` record carrying the exit code that will be used on a clean exit.
#[must_use]
pub fn log_entries(summary: &LeakSummary, pid: u32, exit_code: i32) -> Vec<LeakLogEntry> {
    let run = format!("leakshim::{pid}");
    let mut entries = Vec::with_capacity(summary.groups.len() + 1);
    for (i, group) in summary.groups.iter().enumerate() {
        let mut entry = LeakLogEntry::new(format!("{run}::{:03}", i + 1), LogLevel::Error, EVENT_LEAK);
        entry.bytes = Some(group.total_bytes);
        entry.objects = Some(group.objects);
        entry.thread_id = Some(group.owner.get());
        entry.frames = Some(
            group
                .trace
                .frames()
                .iter()
                .map(|ip| format!("{ip:#x}"))
                .collect(),
        );
        entries.push(entry);
    }
    let level = if summary.has_leaks() {
        LogLevel::Error
    } else {
        LogLevel::Info
    };
    let mut tail = LeakLogEntry::new(format!("{run}::summary"), level, EVENT_SUMMARY);
    tail.bytes = Some(summary.leaked_bytes);
    tail.objects = Some(summary.leaked_objects);
    tail.groups = Some(summary.groups.len());
    if summary.has_leaks() {
        tail.exit_code = Some(exit_code);
    }
    entries.push(tail);
    entries
}

/// Append the report records to `path`, one JSON object per line.
pub fn write_jsonl(path: &Path, entries: &[LeakLogEntry]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut buf = String::new();
    for entry in entries {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        buf.push_str(&line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())?;
    file.flush()
}

/// One schema violation in a report file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLineError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ReportLineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}: {}", self.line_number, self.field, self.message)
    }
}

/// Validate one JSONL line against the report schema.
pub fn validate_report_line(
    line: &str,
    line_number: usize,
) -> Result<LeakLogEntry, Vec<ReportLineError>> {
    let err = |field: &str, message: String| ReportLineError {
        line_number,
        field: field.to_string(),
        message,
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![err("<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![err("<root>", "expected JSON object".to_string())]);
    };

    let mut errors = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(err(field, "required field missing".to_string()));
        }
    }
    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !["info", "warn", "error"].contains(&level)
    {
        errors.push(err("level", format!("invalid level: '{level}'")));
    }
    match obj.get("event").and_then(|v| v.as_str()) {
        Some(EVENT_LEAK) => {
            for field in ["bytes", "objects", "frames"] {
                if !obj.contains_key(field) {
                    errors.push(err(field, "required for leak events".to_string()));
                }
            }
        }
        Some(EVENT_SUMMARY) => {
            for field in ["bytes", "objects"] {
                if !obj.contains_key(field) {
                    errors.push(err(field, "required for summary events".to_string()));
                }
            }
        }
        Some(other) => errors.push(err("event", format!("unknown event: '{other}'"))),
        None => {}
    }
    if let Some(frames) = obj.get("frames").and_then(|v| v.as_array()) {
        for frame in frames {
            let ok = frame
                .as_str()
                .and_then(|s| s.strip_prefix("0x"))
                .is_some_and(|hex| usize::from_str_radix(hex, 16).is_ok());
            if !ok {
                errors.push(err("frames", format!("not a hex address: {frame}")));
            }
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value(value).map_err(|e| vec![err("<schema>", e.to_string())])
}

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
