//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code waits on I/O, channels or timers, never on a
//! sleep used as poor man's synchronization.
//! **Exceptions**: reconnection backoff in the connection supervisor,
//! simulated latency in the loopback transport, and deadline timers that
//! are raced inside `tokio::select!`.

use architectural_enforcement::{production_lines, rust_files, violation};

const SOURCE_DIRS: [&str; 2] = ["bridge/core/src", "bridge/daemon/src"];

/// Files allowed to await a sleep directly
const SLEEP_ALLOWED: [&str; 2] = ["connection/supervisor.rs", "connection/loopback.rs"];

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let mut violations = Vec::new();
    for dir in SOURCE_DIRS {
        for path in rust_files(dir) {
            for (line, code) in production_lines(&path) {
                if code.contains("thread::sleep(") {
                    violations.push(violation(&path, line, &code));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "\nBlocking sleep found in production code (use async waits):\n  {}\n",
        violations.join("\n  ")
    );
}

#[test]
fn test_no_sleep_polling_in_production_code() {
    let mut violations = Vec::new();
    for dir in SOURCE_DIRS {
        for path in rust_files(dir) {
            let allowed = SLEEP_ALLOWED.iter().any(|suffix| path.ends_with(suffix));
            for (line, code) in production_lines(&path) {
                if !code.contains("sleep(") || code.contains("thread::sleep(") {
                    continue;
                }
                // A timer future bound for a select is a deadline, not a poll
                let deadline_timer = code.contains("let deadline") || code.contains("=>");
                if !allowed && !deadline_timer {
                    violations.push(violation(&path, line, &code));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "\nSleep used outside backoff, simulated latency or deadlines:\n  {}\n",
        violations.join("\n  ")
    );
}

#[test]
fn test_periodic_work_uses_interval() {
    // Maintenance and metrics loops must tick on an interval
    let mut loops_found = 0;
    for dir in SOURCE_DIRS {
        for path in rust_files(dir) {
            let lines = production_lines(&path);
            if lines.iter().any(|(_, code)| code.contains("tokio::time::interval(")) {
                loops_found += 1;
            }
        }
    }
    assert!(loops_found >= 2, "expected interval-driven maintenance and metrics loops");
}
