//! Integration Test: Router Purity
//!
//! **Policy**: `Router::decide` and request profiling are pure functions of
//! their inputs. They never suspend, read a clock, draw random numbers or
//! touch the network, so the same inputs always give the same decision.

use architectural_enforcement::{production_lines, rust_files, violation};

const PURE_FILES: [&str; 2] = ["routing/policy.rs", "routing/profile.rs"];

const FORBIDDEN: [&str; 10] = [
    ".await",
    "async fn",
    "tokio::",
    "Instant",
    "SystemTime",
    "Utc::now",
    "rand::",
    "reqwest",
    "std::fs",
    "std::net",
];

#[test]
fn test_router_has_no_io_clock_or_randomness() {
    let files: Vec<_> = rust_files("bridge/core/src")
        .into_iter()
        .filter(|p| PURE_FILES.iter().any(|suffix| p.ends_with(suffix)))
        .collect();
    assert_eq!(files.len(), PURE_FILES.len(), "router sources moved");

    let mut violations = Vec::new();
    for path in &files {
        for (line, code) in production_lines(path) {
            if FORBIDDEN.iter().any(|pattern| code.contains(pattern)) {
                violations.push(violation(path, line, &code));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "\nRouter code must stay pure:\n  {}\n",
        violations.join("\n  ")
    );
}

#[test]
fn test_library_never_installs_subscriber() {
    let mut violations = Vec::new();
    for path in rust_files("bridge/core/src") {
        for (line, code) in production_lines(&path) {
            if code.contains("tracing_subscriber") {
                violations.push(violation(&path, line, &code));
            }
        }
    }
    assert!(
        violations.is_empty(),
        "\nOnly binaries may install a tracing subscriber:\n  {}\n",
        violations.join("\n  ")
    );
}

#[test]
fn test_no_unwrap_in_production_code() {
    let mut violations = Vec::new();
    for dir in ["bridge/core/src", "bridge/daemon/src"] {
        for path in rust_files(dir) {
            for (line, code) in production_lines(&path) {
                if code.contains(".unwrap()") || code.contains(".expect(") {
                    violations.push(violation(&path, line, &code));
                }
            }
        }
    }
    assert!(
        violations.is_empty(),
        "\nPropagate errors instead of panicking:\n  {}\n",
        violations.join("\n  ")
    );
}
