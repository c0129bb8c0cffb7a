//! Tool-call tracking for worker supervision.
//!
//! Tracks outstanding `tool_use` calls by category, derives the active
//! slow-tool deadline (the longest outstanding one -- a later call with a
//! shorter timeout never shrinks the deadline), follows background
//! launchers through their reported task ids, and drains them again when
//! a `TaskOutput` result carries a terminal status.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;

use crate::config::SlowToolTimeouts;

/// Tool names that count as code-modifying for API-error recovery.
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit", "Bash"];

/// Returns true for tools that may modify the working tree.
pub fn is_write_tool(name: &str) -> bool {
    WRITE_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Category of a tool call, inferred from the tool name plus a substring
/// scan over its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCategory {
    Codex,
    Gemini,
    NpmInstall,
    NpmBuild,
    Default,
}

impl ToolCategory {
    /// Infer the category. The scan covers the tool name and the
    /// serialized input (command/args/prompt text included).
    pub fn infer(name: &str, input: &Value) -> Self {
        let mut haystack = name.to_lowercase();
        haystack.push(' ');
        haystack.push_str(&input.to_string().to_lowercase());

        if haystack.contains("codex") {
            Self::Codex
        } else if haystack.contains("gemini") {
            Self::Gemini
        } else if haystack.contains("npm") && haystack.contains("install") {
            Self::NpmInstall
        } else if haystack.contains("npm")
            && (haystack.contains("run build") || haystack.contains("build"))
        {
            Self::NpmBuild
        } else {
            Self::Default
        }
    }

    /// The per-category timeout; `None` means unbounded.
    pub fn timeout(&self, timeouts: &SlowToolTimeouts) -> Option<Duration> {
        let ms = match self {
            Self::Codex => timeouts.codex_ms,
            Self::Gemini => timeouts.gemini_ms,
            Self::NpmInstall => timeouts.npm_install_ms,
            Self::NpmBuild => timeouts.npm_build_ms,
            Self::Default => timeouts.default_ms,
        };
        ms.map(Duration::from_millis)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::NpmInstall => "npmInstall",
            Self::NpmBuild => "npmBuild",
            Self::Default => "default",
        }
    }
}

/// One tracked tool call.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub category: ToolCategory,
    pub started: Instant,
    /// Launched with a `run_in_background` flag.
    pub background: bool,
}

/// Outcome of feeding a `tool_result` into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResultOutcome {
    /// A synchronous call finished.
    Finished { name: String },
    /// A background launcher finished; the launched task id is now
    /// pending and the slow-tool state stays up.
    BackgroundLaunched { name: String, background_id: String },
    /// A background launcher finished but no task id could be extracted.
    BackgroundLostTrack { name: String },
    /// `TaskOutput` reported these background tasks terminal.
    BackgroundDrained { ids: Vec<String> },
    /// The result did not match any outstanding call.
    Unmatched,
}

static BACKGROUND_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:with\s+id|task[_\s-]?id|id)\b\s*[:：]\s*`?([A-Za-z0-9][A-Za-z0-9_-]{2,})`?")
        .unwrap()
});

static TERMINAL_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(completed_with_errors|completed|failed|cancelled|success|error|done|finished|exited|timeout|killed|terminated|aborted)\b",
    )
    .unwrap()
});

/// Terminal status words recognized in structured `TaskOutput` payloads.
const TERMINAL_STATUSES: &[&str] = &[
    "completed",
    "failed",
    "cancelled",
    "success",
    "error",
    "done",
    "finished",
    "exited",
    "timeout",
    "killed",
    "terminated",
    "aborted",
    "completed_with_errors",
];

/// Maximum distance between a status word and the task id for the
/// text-pattern fallback.
const STATUS_ID_WINDOW: usize = 100;

/// Tracker for one worker's outstanding and background tool calls.
#[derive(Debug)]
pub struct ToolTracker {
    timeouts: SlowToolTimeouts,
    outstanding: HashMap<String, ToolCall>,
    background: HashMap<String, ToolCall>,
}

impl ToolTracker {
    pub fn new(timeouts: SlowToolTimeouts) -> Self {
        Self {
            timeouts,
            outstanding: HashMap::new(),
            background: HashMap::new(),
        }
    }

    /// Record a `tool_use`. Returns the call for logging.
    pub fn on_tool_use(&mut self, id: &str, name: &str, input: &Value) -> ToolCall {
        let category = ToolCategory::infer(name, input);
        let background = input.to_string().contains("run_in_background");
        let call = ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            category,
            started: Instant::now(),
            background,
        };
        self.outstanding.insert(id.to_string(), call.clone());
        call
    }

    /// Record a `tool_result` for a prior `tool_use` id.
    pub fn on_tool_result(&mut self, tool_use_id: &str, content: &str) -> ToolResultOutcome {
        let Some(call) = self.outstanding.remove(tool_use_id) else {
            return ToolResultOutcome::Unmatched;
        };

        // TaskOutput results drain background tasks rather than launch
        // them.
        if call.name.eq_ignore_ascii_case("TaskOutput") {
            let ids = self.drain_terminal_background(content);
            return ToolResultOutcome::BackgroundDrained { ids };
        }

        // A background launcher of a delegated-agent category keeps the
        // slow-tool state alive until its task id is drained.
        if call.background
            && matches!(call.category, ToolCategory::Codex | ToolCategory::Gemini)
        {
            match extract_background_id(content) {
                Some(bg_id) => {
                    self.background.insert(bg_id.clone(), call.clone());
                    return ToolResultOutcome::BackgroundLaunched {
                        name: call.name,
                        background_id: bg_id,
                    };
                }
                None => {
                    return ToolResultOutcome::BackgroundLostTrack { name: call.name };
                }
            }
        }

        ToolResultOutcome::Finished { name: call.name }
    }

    /// The currently tracked slow tool: the outstanding or background
    /// call with the longest deadline. An unbounded category always wins.
    pub fn current_slow(&self) -> Option<&ToolCall> {
        self.outstanding
            .values()
            .chain(self.background.values())
            .max_by_key(|call| match call.category.timeout(&self.timeouts) {
                None => (true, Instant::now()),
                Some(t) => (false, call.started + t),
            })
    }

    /// Whether any background task is still pending.
    pub fn has_pending_background(&self) -> bool {
        !self.background.is_empty()
    }

    /// Whether any tool call (sync or background) is still outstanding.
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty() && self.background.is_empty()
    }

    /// If the active slow tool exceeded its category timeout, return it
    /// with the elapsed time.
    pub fn slow_timeout_exceeded(&self, now: Instant) -> Option<(ToolCall, Duration)> {
        let call = self.current_slow()?;
        let timeout = call.category.timeout(&self.timeouts)?;
        let elapsed = now.duration_since(call.started);
        if elapsed > timeout {
            Some((call.clone(), elapsed))
        } else {
            None
        }
    }

    /// Scan `TaskOutput` content and remove background tasks it reports
    /// terminal. Returns the drained ids.
    fn drain_terminal_background(&mut self, content: &str) -> Vec<String> {
        let terminal: Vec<String> = self
            .background
            .keys()
            .filter(|id| reports_terminal_status(content, id))
            .cloned()
            .collect();
        for id in &terminal {
            self.background.remove(id);
        }
        terminal
    }
}

/// Extract a background task id from launcher output (`ID:`, `task_id:`,
/// `with ID:` patterns).
pub fn extract_background_id(content: &str) -> Option<String> {
    BACKGROUND_ID_RE
        .captures(content)
        .map(|caps| caps.get(1).unwrap().as_str().to_string())
}

/// Decide whether `content` reports a terminal status for `bg_id`.
///
/// Structured payloads are checked first (a JSON object with a
/// `status`/`state` field). The text fallback requires the status word
/// and the task id within 100 characters of each other and rejects
/// negated phrasings ("not done", "failed to complete").
pub fn reports_terminal_status(content: &str, bg_id: &str) -> bool {
    // Structured check.
    if let Ok(v) = serde_json::from_str::<Value>(content) {
        let status = v
            .get("status")
            .or_else(|| v.get("state"))
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase());
        if let Some(status) = status {
            if TERMINAL_STATUSES.contains(&status.as_str()) {
                let id_matches = v
                    .get("task_id")
                    .or_else(|| v.get("id"))
                    .and_then(Value::as_str)
                    .map(|id| id == bg_id)
                    .unwrap_or_else(|| content.contains(bg_id));
                if id_matches {
                    return true;
                }
            }
            return false;
        }
    }

    // Text fallback.
    let Some(id_pos) = content.find(bg_id) else {
        return false;
    };
    for m in TERMINAL_STATUS_RE.find_iter(content) {
        let distance = if m.start() >= id_pos {
            m.start() - id_pos
        } else {
            id_pos - m.start()
        };
        if distance > STATUS_ID_WINDOW {
            continue;
        }
        if is_negated(content, m.start(), m.end()) {
            continue;
        }
        return true;
    }
    false
}

/// Reject "not done", "never completed", "hasn't finished", and
/// "failed/unable to complete" style phrasings.
fn is_negated(content: &str, start: usize, end: usize) -> bool {
    let before = &content[..start];
    let before_tail = before
        .char_indices()
        .rev()
        .take(16)
        .last()
        .map(|(i, _)| &before[i..])
        .unwrap_or(before)
        .to_lowercase();
    if before_tail.ends_with("not ")
        || before_tail.ends_with("n't ")
        || before_tail.ends_with("never ")
        || before_tail.ends_with("failed to ")
        || before_tail.ends_with("unable to ")
    {
        return true;
    }

    // "failed to complete": the word itself introduces a negated verb.
    let word = content[start..end].to_lowercase();
    if word == "failed" || word == "unable" {
        let after = content[end..].trim_start();
        if after.starts_with("to ") {
            return true;
        }
    }
    false
}
