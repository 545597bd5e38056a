//! Architecture enforcement lint - event loops must never block.
//!
//! Every app is a single-threaded cooperative loop; one blocking call
//! stalls every timer and inbox behind it. This test scans the library
//! source for patterns that block the executor:
//! - `std::thread::sleep` (use `tokio::time::sleep`)
//! - `block_on` (apps are already async)
//! - `std::process::Command` (use `tokio::process::Command`)
//!
//! Exceptions: build.rs (runs at compile time, not under the runtime).

use std::fs;
use walkdir::WalkDir;

/// Patterns that block the async executor.
const DISALLOWED_PATTERNS: &[(&str, &str)] = &[
    ("std::thread::sleep", "Use tokio::time::sleep instead"),
    ("thread::sleep", "Use tokio::time::sleep instead"),
    ("block_on", "Apps are async; await the future instead"),
    (
        "std::process::Command",
        "Use tokio::process::Command so the loop keeps running",
    ),
];

/// Files allowed to carry the pattern (with a reason).
const ALLOWED_FILES: &[&str] = &[
    // Compile-time only; never runs under the tokio runtime.
    "build.rs",
];

fn strip_test_modules(content: &str) -> String {
    // Drop everything from a `#[cfg(test)]` marker onwards; in this
    // codebase test modules always sit at the end of the file.
    match content.find("#[cfg(test)]") {
        Some(pos) => content[..pos].to_string(),
        None => content.to_string(),
    }
}

#[test]
fn test_no_blocking_calls_in_library_source() {
    let mut violations = Vec::new();

    for entry in WalkDir::new("src")
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let path = entry.path();
        let path_str = path.to_string_lossy();
        if ALLOWED_FILES.iter().any(|f| path_str.ends_with(f)) {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        let content = strip_test_modules(&content);

        for (line_no, line) in content.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") {
                continue;
            }
            for (pattern, hint) in DISALLOWED_PATTERNS {
                if trimmed.contains(pattern) {
                    violations.push(format!(
                        "{}:{}: `{}` - {}",
                        path_str,
                        line_no + 1,
                        pattern,
                        hint
                    ));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "Blocking calls found in event-loop code:\n{}",
        violations.join("\n")
    );
}

#[test]
fn test_shared_locks_only_built_in_shared_module() {
    // TopologyWrapper and ConfigHelper live behind the SharedState locks;
    // apps must receive handles, never wrap their own.
    let mut violations = Vec::new();

    for entry in WalkDir::new("src")
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let path = entry.path();
        let path_str = path.to_string_lossy().into_owned();
        if path_str.ends_with("shared.rs") || path_str.ends_with("state.rs") {
            continue; // the designated owners
        }
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        let content = strip_test_modules(&content);
        for needle in ["RwLock<TopologyWrapper>", "RwLock<ConfigHelper>"] {
            if content.contains(needle) {
                violations.push(format!("{}: constructs {}", path_str, needle));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "Shared objects wrapped outside their owner:\n{}",
        violations.join("\n")
    );
}
