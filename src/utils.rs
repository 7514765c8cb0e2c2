//! Utility functions shared across the codebase

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current time in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Substitute the `{i}` (test index) and `{j}` (iteration) placeholders in
/// a command or file-name pattern. Any other braces pass through untouched
/// so shell constructs keep working.
pub fn substitute(pattern: &str, i: u64, j: u32) -> String {
    pattern
        .replace("{i}", &i.to_string())
        .replace("{j}", &j.to_string())
}
