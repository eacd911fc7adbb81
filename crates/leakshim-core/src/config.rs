//! Runtime configuration.
//!
//! Configuration comes from environment variables, read once during shim
//! initialization:
//! - `LEAKSHIM_EXITCODE` (default 23): status substituted for a successful exit when
//!   leaks were reported.
//! - `LEAKSHIM_LEAK_CHECK_AT_EXIT` (default on): register the at-exit leak check.
//! - `LEAKSHIM_MALLOC_CONTEXT_SIZE` (default 16): frames captured per allocation.
//! - `LEAKSHIM_VERBOSITY` (default 0): 1 prints an init summary, 2 adds the
//!   interception table.
//! - `LEAKSHIM_LOG_PATH`: write the leak report as JSONL to this path.
//! - `LEAKSHIM_MAX_LEAKS` (default 0 = unlimited): cap on leak groups printed.
//! - `LEAKSHIM_USE_GLOBALS` (default on): treat writable data segments of loaded
//!   objects as roots during the leak check.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use crate::callsite::MAX_TRACE_DEPTH;

pub const DEFAULT_EXITCODE: i32 = 23;

pub const ENV_EXITCODE: &str = "LEAKSHIM_EXITCODE";
pub const ENV_LEAK_CHECK_AT_EXIT: &str = "LEAKSHIM_LEAK_CHECK_AT_EXIT";
pub const ENV_MALLOC_CONTEXT_SIZE: &str = "LEAKSHIM_MALLOC_CONTEXT_SIZE";
pub const ENV_VERBOSITY: &str = "LEAKSHIM_VERBOSITY";
pub const ENV_LOG_PATH: &str = "LEAKSHIM_LOG_PATH";
pub const ENV_MAX_LEAKS: &str = "LEAKSHIM_MAX_LEAKS";
pub const ENV_USE_GLOBALS: &str = "LEAKSHIM_USE_GLOBALS";

/// Resolved shim configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakConfig {
    pub exitcode: i32,
    pub leak_check_at_exit: bool,
    /// Frames captured per allocation, clamped to [`MAX_TRACE_DEPTH`].
    pub malloc_context_size: usize,
    pub verbosity: u8,
    pub log_path: Option<PathBuf>,
    /// Maximum number of leak groups printed; 0 prints all of them.
    pub max_leaks: usize,
    pub use_globals: bool,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            exitcode: DEFAULT_EXITCODE,
            leak_check_at_exit: true,
            malloc_context_size: MAX_TRACE_DEPTH,
            verbosity: 0,
            log_path: None,
            max_leaks: 0,
            use_globals: true,
        }
    }
}

impl LeakConfig {
    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to the default for that field.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let exitcode = lookup(ENV_EXITCODE)
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(defaults.exitcode);
        let leak_check_at_exit = lookup(ENV_LEAK_CHECK_AT_EXIT)
            .and_then(|v| parse_bool_loose(&v))
            .unwrap_or(defaults.leak_check_at_exit);
        let malloc_context_size = lookup(ENV_MALLOC_CONTEXT_SIZE)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map_or(defaults.malloc_context_size, |n| n.min(MAX_TRACE_DEPTH));
        let verbosity = lookup(ENV_VERBOSITY)
            .and_then(|v| v.trim().parse::<u8>().ok())
            .unwrap_or(defaults.verbosity);
        let log_path = lookup(ENV_LOG_PATH)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let max_leaks = lookup(ENV_MAX_LEAKS)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(defaults.max_leaks);
        let use_globals = lookup(ENV_USE_GLOBALS)
            .and_then(|v| parse_bool_loose(&v))
            .unwrap_or(defaults.use_globals);
        Self {
            exitcode,
            leak_check_at_exit,
            malloc_context_size,
            verbosity,
            log_path,
            max_leaks,
            use_globals,
        }
    }

    /// Read the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Parse `1/true/yes/on` and `0/false/no/off` (case-insensitive).
#[must_use]
pub fn parse_bool_loose(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Atomic cache: 0=unresolved, 1=resolving, 2=resolved.
// Never blocks: a read during RESOLVING (reentrant or from another thread) gets the
// defaults.
static STATE: AtomicU8 = AtomicU8::new(STATE_UNRESOLVED);

const STATE_UNRESOLVED: u8 = 0;
const STATE_RESOLVING: u8 = 1;
const STATE_RESOLVED: u8 = 2;

static EXITCODE: AtomicI32 = AtomicI32::new(DEFAULT_EXITCODE);
static LEAK_CHECK_AT_EXIT: AtomicBool = AtomicBool::new(true);
static MALLOC_CONTEXT_SIZE: AtomicUsize = AtomicUsize::new(MAX_TRACE_DEPTH);
static VERBOSITY: AtomicU8 = AtomicU8::new(0);
static MAX_LEAKS: AtomicUsize = AtomicUsize::new(0);
static USE_GLOBALS: AtomicBool = AtomicBool::new(true);
static LOG_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

fn publish(config: &LeakConfig) {
    EXITCODE.store(config.exitcode, Ordering::Relaxed);
    LEAK_CHECK_AT_EXIT.store(config.leak_check_at_exit, Ordering::Relaxed);
    MALLOC_CONTEXT_SIZE.store(config.malloc_context_size, Ordering::Relaxed);
    VERBOSITY.store(config.verbosity, Ordering::Relaxed);
    MAX_LEAKS.store(config.max_leaks, Ordering::Relaxed);
    USE_GLOBALS.store(config.use_globals, Ordering::Relaxed);
    // First writer wins; the path is only consulted at report time.
    let _ = LOG_PATH.set(config.log_path.clone());
}

/// Resolve the process configuration from the environment on first call.
///
/// Returns `true` once the cache holds a resolved configuration. A reentrant or
/// concurrent call during resolution returns `false` and the accessors keep
/// serving defaults until the resolver finishes.
pub fn resolve() -> bool {
    match STATE.load(Ordering::Acquire) {
        STATE_RESOLVED => return true,
        STATE_RESOLVING => return false,
        _ => {}
    }
    if STATE
        .compare_exchange(
            STATE_UNRESOLVED,
            STATE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return STATE.load(Ordering::Acquire) == STATE_RESOLVED;
    }
    publish(&LeakConfig::from_env());
    STATE.store(STATE_RESOLVED, Ordering::Release);
    true
}

/// Install an explicit configuration, bypassing the environment.
///
/// Only takes effect while the cache is still unresolved; returns whether it did.
pub fn install(config: &LeakConfig) -> bool {
    if STATE
        .compare_exchange(
            STATE_UNRESOLVED,
            STATE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return false;
    }
    publish(config);
    STATE.store(STATE_RESOLVED, Ordering::Release);
    true
}

#[must_use]
pub fn exitcode() -> i32 {
    resolve();
    EXITCODE.load(Ordering::Relaxed)
}

#[must_use]
pub fn leak_check_at_exit() -> bool {
    resolve();
    LEAK_CHECK_AT_EXIT.load(Ordering::Relaxed)
}

#[must_use]
pub fn malloc_context_size() -> usize {
    MALLOC_CONTEXT_SIZE.load(Ordering::Relaxed)
}

#[must_use]
pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

#[must_use]
pub fn max_leaks() -> usize {
    MAX_LEAKS.load(Ordering::Relaxed)
}

#[must_use]
pub fn use_globals() -> bool {
    USE_GLOBALS.load(Ordering::Relaxed)
}

#[must_use]
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().and_then(|p| p.as_deref())
}

/// Snapshot of the cached configuration.
#[must_use]
pub fn current() -> LeakConfig {
    resolve();
    LeakConfig {
        exitcode: EXITCODE.load(Ordering::Relaxed),
        leak_check_at_exit: LEAK_CHECK_AT_EXIT.load(Ordering::Relaxed),
        malloc_context_size: malloc_context_size(),
        verbosity: verbosity(),
        log_path: log_path().map(Path::to_path_buf),
        max_leaks: max_leaks(),
        use_globals: use_globals(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = LeakConfig::from_lookup(|_| None);
        assert_eq!(config, LeakConfig::default());
        assert_eq!(config.exitcode, 23);
        assert!(config.leak_check_at_exit);
        assert_eq!(config.malloc_context_size, MAX_TRACE_DEPTH);
        assert!(config.use_globals);
    }

    #[test]
    fn every_variable_is_honoured() {
        let config = LeakConfig::from_lookup(lookup_from(&[
            (ENV_EXITCODE, "42"),
            (ENV_LEAK_CHECK_AT_EXIT, "off"),
            (ENV_MALLOC_CONTEXT_SIZE, "4"),
            (ENV_VERBOSITY, "2"),
            (ENV_LOG_PATH, "/tmp/leaks.jsonl"),
            (ENV_MAX_LEAKS, "10"),
            (ENV_USE_GLOBALS, "no"),
        ]));
        assert_eq!(config.exitcode, 42);
        assert!(!config.leak_check_at_exit);
        assert_eq!(config.malloc_context_size, 4);
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.log_path.as_deref(), Some(Path::new("/tmp/leaks.jsonl")));
        assert_eq!(config.max_leaks, 10);
        assert!(!config.use_globals);
    }

    #[test]
    fn garbage_values_fall_back_per_field() {
        let config = LeakConfig::from_lookup(lookup_from(&[
            (ENV_EXITCODE, "twenty"),
            (ENV_LEAK_CHECK_AT_EXIT, "maybe"),
            (ENV_VERBOSITY, "-1"),
            (ENV_LOG_PATH, "   "),
        ]));
        assert_eq!(config, LeakConfig::default());
    }

    #[test]
    fn context_size_is_clamped() {
        let config = LeakConfig::from_lookup(lookup_from(&[(ENV_MALLOC_CONTEXT_SIZE, "500")]));
        assert_eq!(config.malloc_context_size, MAX_TRACE_DEPTH);
        let config = LeakConfig::from_lookup(lookup_from(&[(ENV_MALLOC_CONTEXT_SIZE, "0")]));
        assert_eq!(config.malloc_context_size, 0);
    }

    #[test]
    fn negative_exitcode_is_accepted() {
        let config = LeakConfig::from_lookup(lookup_from(&[(ENV_EXITCODE, " -3 ")]));
        assert_eq!(config.exitcode, -3);
    }

    #[test]
    fn loose_booleans() {
        for raw in ["1", "true", "TRUE", "yes", "On"] {
            assert_eq!(parse_bool_loose(raw), Some(true), "{raw}");
        }
        for raw in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_bool_loose(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool_loose(""), None);
        assert_eq!(parse_bool_loose("2"), None);
    }

    #[test]
    fn cache_state_machine() {
        resolve();
        assert_eq!(STATE.load(Ordering::SeqCst), STATE_RESOLVED);
        assert!(!install(&LeakConfig {
            exitcode: 99,
            ..LeakConfig::default()
        }));
        assert!(resolve());

        // Reentrant read during resolution: defaults, no second install.
        let previous = STATE.swap(STATE_RESOLVING, Ordering::SeqCst);
        assert!(!resolve());
        assert!(!install(&LeakConfig::default()));
        STATE.store(previous, Ordering::SeqCst);
        assert!(resolve());
    }
}
