//! Run a target program under the shim.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use leakshim_core::config::{ENV_EXITCODE, ENV_LOG_PATH, ENV_MAX_LEAKS, ENV_VERBOSITY};

use crate::HarnessError;

/// File name of the preload library produced by `leakshim-abi`.
pub const SHIM_FILE_NAME: &str = "libleakshim_abi.so";

/// Directories searched for the shim when `--shim` is not given, relative to the
/// directory holding the running executable.
const SHIM_SEARCH: &[&str] = &[".", "../lib", "../release", "release"];

#[derive(Debug, Clone, Default)]
pub struct Launcher {
    pub shim: Option<PathBuf>,
    pub exitcode: Option<i32>,
    pub log_path: Option<PathBuf>,
    pub verbosity: Option<u8>,
    pub max_leaks: Option<usize>,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub status: ExitStatus,
    pub shim: PathBuf,
}

impl LaunchOutcome {
    /// Exit code to propagate: the child's, or `128 + signal` when it was killed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = self.status.signal() {
                return 128 + sig;
            }
        }
        1
    }
}

impl Launcher {
    /// Locate the shim: the explicit path, else next to the current executable.
    pub fn resolve_shim(&self) -> Result<PathBuf, HarnessError> {
        if let Some(path) = &self.shim {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(HarnessError::ShimNotFound(path.clone()))
            };
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().unwrap_or(Path::new("."));
        SHIM_SEARCH
            .iter()
            .map(|rel| dir.join(rel).join(SHIM_FILE_NAME))
            .find(|p| p.is_file())
            .ok_or_else(|| HarnessError::ShimNotFound(dir.join(SHIM_FILE_NAME)))
    }

    /// Build the command without spawning it.
    pub fn command(&self, shim: &Path, program: &[OsString]) -> Result<Command, HarnessError> {
        let (exe, args) = program.split_first().ok_or(HarnessError::MissingProgram)?;
        let mut cmd = Command::new(exe);
        cmd.args(args);
        cmd.env("LD_PRELOAD", preload_value(shim, std::env::var_os("LD_PRELOAD")));
        if let Some(code) = self.exitcode {
            cmd.env(ENV_EXITCODE, code.to_string());
        }
        if let Some(path) = &self.log_path {
            cmd.env(ENV_LOG_PATH, path);
        }
        if let Some(v) = self.verbosity {
            cmd.env(ENV_VERBOSITY, v.to_string());
        }
        if let Some(n) = self.max_leaks {
            cmd.env(ENV_MAX_LEAKS, n.to_string());
        }
        Ok(cmd)
    }

    /// Spawn `program` under the shim and wait for it.
    pub fn run(&self, program: &[OsString]) -> Result<LaunchOutcome, HarnessError> {
        let shim = self.resolve_shim()?;
        let status = self.command(&shim, program)?.status()?;
        Ok(LaunchOutcome { status, shim })
    }
}

/// The shim goes first so its definitions win over other preloads.
fn preload_value(shim: &Path, existing: Option<OsString>) -> OsString {
    let mut value = OsString::from(shim);
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}
