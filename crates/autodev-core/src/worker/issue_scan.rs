//! Structured issue extraction from the worker stream.
//!
//! Agents report defects as plain lines starting with `AUTO_DEV_ISSUE:`
//! followed by a JSON object. The payload's first balanced `{...}` is
//! extracted (trailing prose is tolerated) and validated; invalid
//! payloads are discarded. Reporting an issue never fails the task.

use serde_json::Value;
use tracing::debug;

use crate::issue::{IssueSeverity, RawIssue};

/// Line prefix that marks an issue report.
pub const ISSUE_MARKER: &str = "AUTO_DEV_ISSUE:";

/// Scan one stream line for an issue report.
pub fn scan_line(line: &str) -> Option<RawIssue> {
    let trimmed = line.trim_start();
    let payload = trimmed.strip_prefix(ISSUE_MARKER)?;
    let json_text = extract_balanced_json(payload)?;
    let value: Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "discarding unparseable issue payload");
            return None;
        }
    };
    validate_payload(value)
}

/// Scan a multi-line text blob (assistant output) for issue reports.
pub fn scan_text(text: &str) -> Vec<RawIssue> {
    text.lines().filter_map(scan_line).collect()
}

/// Extract the first balanced `{...}` from `s`, tolerating prose before
/// and after. String literals and escapes are honored so braces inside
/// strings do not unbalance the scan.
pub fn extract_balanced_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate an issue payload: `title` (non-empty) and `severity`
/// (lowercased into warning/error/blocker) are required; `files` accepts
/// an array or a single string; `signature`, `details`, and
/// `ownerTaskId` are optional.
fn validate_payload(value: Value) -> Option<RawIssue> {
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();

    let severity: IssueSeverity = value
        .get("severity")
        .and_then(Value::as_str)?
        .parse()
        .ok()?;

    let files = match value.get("files") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    let get_string = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };

    Some(RawIssue {
        title,
        severity,
        files,
        signature: get_string("signature"),
        details: get_string("details"),
        owner_task_id: get_string("ownerTaskId").map(|id| id.to_uppercase()),
    })
}
