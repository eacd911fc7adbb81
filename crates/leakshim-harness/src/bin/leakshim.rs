//! CLI entrypoint for the leakshim launcher.

#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use leakshim_harness::{Launcher, report_file};

/// Run programs under the leakshim leak detector.
#[derive(Debug, Parser)]
#[command(name = "leakshim")]
#[command(about = "Leak detection by allocation interception")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program with the shim preloaded.
    Run {
        /// Exit code substituted for a successful exit when leaks are found.
        #[arg(long)]
        exitcode: Option<i32>,
        /// Write the JSONL leak report here.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Path to libleakshim_abi.so (default: next to this executable).
        #[arg(long)]
        shim: Option<PathBuf>,
        /// Diagnostic verbosity inside the target (0-2).
        #[arg(long)]
        verbosity: Option<u8>,
        /// Print at most this many leak groups (0 = all).
        #[arg(long)]
        max_leaks: Option<usize>,
        /// Program and its arguments.
        #[arg(last = true, required = true)]
        program: Vec<OsString>,
    },
    /// Validate a JSONL leak report and print a summary.
    ValidateReport {
        /// Report file to check.
        path: PathBuf,
        /// Emit the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("leakshim: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(command: Command) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Command::Run {
            exitcode,
            log,
            shim,
            verbosity,
            max_leaks,
            program,
        } => {
            if let Some(path) = &log {
                // Reports append; start from an empty file for this run.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
            let launcher = Launcher {
                shim,
                exitcode,
                log_path: log.clone(),
                verbosity,
                max_leaks,
            };
            let outcome = launcher.run(&program)?;
            if let Some(path) = &log {
                if path.exists() {
                    let digest = report_file::digest_file(path)?;
                    eprintln!("leakshim: {digest}");
                } else {
                    eprintln!("leakshim: no report written to {}", path.display());
                }
            }
            let code = outcome.exit_code();
            Ok(ExitCode::from(u8::try_from(code & 0xff).unwrap_or(1)))
        }
        Command::ValidateReport { path, json } => {
            let digest = report_file::digest_file(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&digest)?);
            } else {
                println!("{}: OK, {digest}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
