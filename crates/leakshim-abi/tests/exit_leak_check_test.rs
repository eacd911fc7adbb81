#![cfg(target_os = "linux")]

//! The at-exit path resolves once per process, so this file holds a single test.

mod common;

use leakshim_abi::malloc_abi::{free, malloc};
use leakshim_abi::process_abi::{recorded_exit_status, run_exit_leak_check};
use leakshim_abi::runtime_state;
use leakshim_core::config::LeakConfig;
use leakshim_core::engine::report::validate_report_line;

#[test]
fn leak_turns_successful_exit_into_leak_exitcode() {
    let log = std::env::temp_dir().join(format!("leakshim-exit-{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&log);
    common::install_config(LeakConfig {
        exitcode: 42,
        leak_check_at_exit: false,
        log_path: Some(log.clone()),
        ..LeakConfig::default()
    });
    let _guard = common::acquire_test_guard();

    let leaked = unsafe { malloc(333) };
    let freed = unsafe { malloc(10) };
    unsafe { free(freed) };
    assert!(!leaked.is_null());

    assert_eq!(recorded_exit_status(), None);
    assert_eq!(run_exit_leak_check(), Some(42));
    assert!(runtime_state::has_reported_leaks());
    // Resolution is latched.
    assert_eq!(run_exit_leak_check(), None);

    let text = std::fs::read_to_string(&log).expect("report written");
    let mut leak_bytes = Vec::new();
    let mut summaries = 0;
    for (i, line) in text.lines().enumerate() {
        validate_report_line(line, i + 1).unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        match value["event"].as_str() {
            Some("leak") => leak_bytes.push(value["bytes"].as_u64().unwrap()),
            Some("summary") => {
                summaries += 1;
                assert_eq!(value["exit_code"].as_i64(), Some(42));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(leak_bytes.contains(&333));
    assert!(!leak_bytes.contains(&10));
    assert_eq!(summaries, 2, "one summary per check");

    unsafe { free(leaked) };
    let _ = std::fs::remove_file(&log);
}
