//! Task model: identity, status, kind derivation, and runtime fields.
//!
//! Tasks are created by the plan parser and mutated only by the scheduler's
//! single-writer loop. The plan file remains authoritative for terminal
//! states read back on reload.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches a well-formed task id: `\w+[.-]\w+([.-]\w+)*`, e.g. `BE-1.2`,
/// `INT-WAVE2`, `FE.LOGIN`. Anchored variants are built where needed.
pub static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+[.-]\w+([.-]\w+)*").unwrap());

static TASK_ID_EXACT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+[.-]\w+([.-]\w+)*$").unwrap());

/// Returns true when `s` is a complete, well-formed task id.
pub fn is_task_id(s: &str) -> bool {
    TASK_ID_EXACT_RE.is_match(s)
}

/// Canonicalize a task id: trim and upper-case.
pub fn canonical_task_id(s: &str) -> String {
    s.trim().to_uppercase()
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Canceled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of a task, derived from its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Prototype,
    Audit,
    Frontend,
    Backend,
    Integration,
    Review,
    General,
}

impl TaskKind {
    /// Derive the kind from the id prefix (the segment before the first
    /// `.` or `-`).
    pub fn from_task_id(id: &str) -> Self {
        let prefix = id
            .split(['.', '-'])
            .next()
            .unwrap_or_default()
            .to_uppercase();
        match prefix.as_str() {
            "PROTO" | "PROTOTYPE" => Self::Prototype,
            "AUDIT" => Self::Audit,
            "FE" | "FRONTEND" | "UI" => Self::Frontend,
            "BE" | "BACKEND" | "API" => Self::Backend,
            "INT" | "INTEGRATION" | "FIX" => Self::Integration,
            "REVIEW" => Self::Review,
            _ => Self::General,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prototype => "prototype",
            Self::Audit => "audit",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Integration => "integration",
            Self::Review => "review",
            Self::General => "general",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Agent provider a persona belongs to. Only whitelisted providers are
/// accepted when resolving persona prompt files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaProvider {
    Gemini,
    Codex,
    Shared,
}

impl fmt::Display for PersonaProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Shared => "shared",
        };
        f.write_str(s)
    }
}

impl FromStr for PersonaProvider {
    type Err = PersonaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "codex" => Ok(Self::Codex),
            "shared" => Ok(Self::Shared),
            other => Err(PersonaParseError(other.to_owned())),
        }
    }
}

/// A `<provider>/<name>` persona reference from the plan file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub provider: PersonaProvider,
    pub name: String,
}

static PERSONA_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap());

impl Persona {
    /// Parse a `<provider>/<name>` reference. The provider must be
    /// whitelisted and the name must match `^[a-z0-9][a-z0-9_-]*$`.
    pub fn parse(s: &str) -> Result<Self, PersonaParseError> {
        let (provider, name) = s
            .split_once('/')
            .ok_or_else(|| PersonaParseError(s.to_owned()))?;
        let provider: PersonaProvider = provider.parse()?;
        let name = name.trim();
        if !PERSONA_NAME_RE.is_match(name) {
            return Err(PersonaParseError(s.to_owned()));
        }
        Ok(Self {
            provider,
            name: name.to_owned(),
        })
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Error returned when a persona reference is malformed.
#[derive(Debug, Clone)]
pub struct PersonaParseError(pub String);

impl fmt::Display for PersonaParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid persona reference: {:?}", self.0)
    }
}

impl std::error::Error for PersonaParseError {}

// ---------------------------------------------------------------------------

/// Declared scope of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    Frontend,
    Backend,
    Full,
}

impl FromStr for TaskScope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FE" | "FRONTEND" => Ok(Self::Frontend),
            "BE" | "BACKEND" => Ok(Self::Backend),
            "FULL" | "FULLSTACK" => Ok(Self::Full),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Default wave for tasks with no wave declaration.
pub const DEFAULT_WAVE: u32 = 99;

/// A task parsed from the plan file plus its scheduler-owned runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Upper-cased unique id matching [`TASK_ID_RE`].
    pub id: String,
    /// Human-readable title from the heading line.
    pub title: String,
    /// Wave number; tasks without a wave declaration land in
    /// [`DEFAULT_WAVE`].
    pub wave: u32,
    /// Ordered-unique dependency ids.
    pub dependencies: Vec<String>,
    /// Estimated context tokens hint, if declared.
    pub estimated_tokens: Option<u64>,
    /// Optional persona reference.
    pub persona: Option<Persona>,
    /// Optional declared scope.
    pub scope: Option<TaskScope>,
    /// Kind derived from the id prefix.
    pub kind: TaskKind,
    /// Free-form metadata fields from the task block.
    pub metadata: BTreeMap<String, String>,

    // -- runtime fields (scheduler-owned) ---------------------------------
    pub status: TaskStatus,
    /// Worker currently holding this task, if any.
    pub worker_id: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration of the last completed run, in seconds.
    pub duration_secs: Option<u64>,
    /// Auto-retry attempt counter; reset by manual retry.
    pub retry_count: u32,
    /// Epoch milliseconds when the next auto-retry becomes due.
    pub next_retry_at: Option<i64>,
    /// API-error recovery bookkeeping.
    pub api_error_retry_count: u32,
    pub is_api_error_recovery: bool,
    /// True when a previous interrupted run executed at least one
    /// write-class tool for this task.
    pub has_modified_code: bool,
}

impl Task {
    /// Create a new task with default runtime state.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = canonical_task_id(&id.into());
        let kind = TaskKind::from_task_id(&id);
        Self {
            id,
            title: title.into(),
            wave: DEFAULT_WAVE,
            dependencies: Vec::new(),
            estimated_tokens: None,
            persona: None,
            scope: None,
            kind,
            metadata: BTreeMap::new(),
            status: TaskStatus::Pending,
            worker_id: None,
            start_time: None,
            end_time: None,
            duration_secs: None,
            retry_count: 0,
            next_retry_at: None,
            api_error_retry_count: 0,
            is_api_error_recovery: false,
            has_modified_code: false,
        }
    }

    /// A task is terminal iff it is `success`/`canceled`, or `failed`
    /// with no retry scheduled.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Success | TaskStatus::Canceled => true,
            TaskStatus::Failed => self.next_retry_at.is_none(),
            _ => false,
        }
    }

    /// True for ids that receive the open-issues digest at spawn time.
    pub fn is_integration_task(&self) -> bool {
        self.id.starts_with("INT-")
            || self.id.starts_with("INTEGRATION")
            || self.id.starts_with("FIX-WAVE")
    }

    /// Clear the auto-retry bookkeeping (on success or manual retry).
    pub fn clear_retry_state(&mut self) {
        self.retry_count = 0;
        self.next_retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_pattern_accepts_dotted_and_dashed_ids() {
        for id in ["BE-1", "FE.LOGIN", "INT-WAVE2", "A-1.2.3", "fix-wave1"] {
            assert!(is_task_id(id), "expected {id:?} to be a valid task id");
        }
    }

    #[test]
    fn task_id_pattern_rejects_single_segment_and_garbage() {
        for id in ["TASK", "", "-A", "A-", "A--", "a b"] {
            assert!(!is_task_id(id), "expected {id:?} to be rejected");
        }
    }

    #[test]
    fn canonical_ids_are_uppercased() {
        assert_eq!(canonical_task_id("  fe-login "), "FE-LOGIN");
    }

    #[test]
    fn kind_derivation_from_prefix() {
        assert_eq!(TaskKind::from_task_id("PROTO-1"), TaskKind::Prototype);
        assert_eq!(TaskKind::from_task_id("AUDIT-BE"), TaskKind::Audit);
        assert_eq!(TaskKind::from_task_id("FE-LOGIN"), TaskKind::Frontend);
        assert_eq!(TaskKind::from_task_id("BE.API"), TaskKind::Backend);
        assert_eq!(TaskKind::from_task_id("INT-2"), TaskKind::Integration);
        assert_eq!(TaskKind::from_task_id("FIX-WAVE1"), TaskKind::Integration);
        assert_eq!(TaskKind::from_task_id("REVIEW-1"), TaskKind::Review);
        assert_eq!(TaskKind::from_task_id("DOCS-1"), TaskKind::General);
    }

    #[test]
    fn persona_parse_accepts_whitelisted_providers() {
        let p = Persona::parse("gemini/ui-designer").unwrap();
        assert_eq!(p.provider, PersonaProvider::Gemini);
        assert_eq!(p.name, "ui-designer");
    }

    #[test]
    fn persona_parse_rejects_bad_provider_and_name() {
        assert!(Persona::parse("openai/foo").is_err());
        assert!(Persona::parse("codex/Bad Name").is_err());
        assert!(Persona::parse("codex/-leading").is_err());
        assert!(Persona::parse("no-slash").is_err());
    }

    #[test]
    fn terminality_rules() {
        let mut t = Task::new("BE-1", "backend");
        assert!(!t.is_terminal());

        t.status = TaskStatus::Success;
        assert!(t.is_terminal());

        t.status = TaskStatus::Failed;
        assert!(t.is_terminal(), "failed without retry is terminal");

        t.next_retry_at = Some(12345);
        assert!(!t.is_terminal(), "failed with a scheduled retry is not");

        t.status = TaskStatus::Canceled;
        assert!(t.is_terminal());
    }

    #[test]
    fn integration_task_prefixes() {
        assert!(Task::new("INT-1", "t").is_integration_task());
        assert!(Task::new("INTEGRATION.2", "t").is_integration_task());
        assert!(Task::new("FIX-WAVE2", "t").is_integration_task());
        assert!(!Task::new("BE-1", "t").is_integration_task());
    }

    #[test]
    fn scope_parsing_is_case_insensitive() {
        assert_eq!("fe".parse::<TaskScope>(), Ok(TaskScope::Frontend));
        assert_eq!("BE".parse::<TaskScope>(), Ok(TaskScope::Backend));
        assert_eq!("Full".parse::<TaskScope>(), Ok(TaskScope::Full));
        assert!("mid".parse::<TaskScope>().is_err());
    }
}
