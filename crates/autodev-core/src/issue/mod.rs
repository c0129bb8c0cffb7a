//! Issue tracker with content-addressed deduplication.
//!
//! Workers report issues over the stream protocol; the tracker merges
//! duplicates under a SHA-1 dedup key, widens severity monotonically, and
//! renders digests for integration-task prompts and Markdown reports.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Severity of an issue. The derived ordering is the merge order:
/// `Warning < Error < Blocker`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
    Blocker,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Blocker => "blocker",
        };
        f.write_str(s)
    }
}

impl FromStr for IssueSeverity {
    type Err = IssueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "blocker" => Ok(Self::Blocker),
            other => Err(IssueError::InvalidSeverity(other.to_owned())),
        }
    }
}

/// Lifecycle status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Fixed,
    Ignored,
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Fixed => "fixed",
            Self::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

impl FromStr for IssueStatus {
    type Err = IssueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "fixed" => Ok(Self::Fixed),
            "ignored" => Ok(Self::Ignored),
            other => Err(IssueError::InvalidStatus(other.to_owned())),
        }
    }
}

/// Errors from tracker operations.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("issue title must be non-empty")]
    EmptyTitle,

    #[error("invalid issue severity: {0:?}")]
    InvalidSeverity(String),

    #[error("invalid issue status: {0:?}")]
    InvalidStatus(String),

    #[error("unknown issue id: {0:?}")]
    UnknownIssue(String),
}

/// A validated issue report before deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIssue {
    pub title: String,
    pub severity: IssueSeverity,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub owner_task_id: Option<String>,
}

/// A canonical (deduplicated) issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Dedup key: 12-hex-char SHA-1 prefix.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reporter_task_id: Option<String>,
    pub reporter_worker_id: Option<u32>,
    pub owner_task_id: Option<String>,
    pub severity: IssueSeverity,
    pub title: String,
    pub details: Option<String>,
    pub files: Vec<String>,
    pub signature: Option<String>,
    pub status: IssueStatus,
    pub occurrences: u32,
}

/// Compute the dedup key for a report: `sha1("sig:" + signature)[..12]`
/// when a signature is present, else
/// `sha1("titleFiles:" + title + sorted-unique-files)[..12]`.
pub fn dedup_key(raw: &RawIssue) -> String {
    let mut hasher = Sha1::new();
    match raw.signature.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(sig) => {
            hasher.update(b"sig:");
            hasher.update(sig.trim().as_bytes());
        }
        None => {
            hasher.update(b"titleFiles:");
            hasher.update(raw.title.as_bytes());
            for file in sorted_unique_files(&raw.files) {
                hasher.update(file.as_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())[..12].to_string()
}

fn files_overlap(a: &[String], b: &[String]) -> bool {
    a.is_empty() || b.is_empty() || a.iter().any(|f| b.contains(f))
}

fn sorted_unique_files(files: &[String]) -> Vec<String> {
    let mut out: Vec<String> = files
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// In-memory issue table, owned by the scheduler coordinator.
#[derive(Debug, Default)]
pub struct IssueTracker {
    issues: HashMap<String, Issue>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore issues from a session snapshot.
    pub fn hydrate(&mut self, issues: Vec<Issue>) {
        self.issues = issues.into_iter().map(|i| (i.id.clone(), i)).collect();
    }

    /// Add a report. Returns the canonical issue and whether it was newly
    /// created (as opposed to merged into an existing one).
    pub fn add(
        &mut self,
        raw: RawIssue,
        reporter_task_id: Option<&str>,
        reporter_worker_id: Option<u32>,
    ) -> Result<(Issue, bool), IssueError> {
        if raw.title.trim().is_empty() {
            return Err(IssueError::EmptyTitle);
        }

        let key = dedup_key(&raw);
        if let Some(existing) = self.issues.get_mut(&key) {
            merge_into(existing, raw);
            return Ok((existing.clone(), false));
        }

        // Signature-less reports also merge into an existing
        // signature-less issue with the same title and an overlapping
        // file set, so a report that widens the file list does not fork
        // a new issue.
        if raw.signature.is_none() {
            let files = sorted_unique_files(&raw.files);
            let candidate = self.issues.values_mut().find(|i| {
                i.signature.is_none()
                    && i.title == raw.title
                    && files_overlap(&i.files, &files)
            });
            if let Some(existing) = candidate {
                merge_into(existing, raw);
                return Ok((existing.clone(), false));
            }
        }

        let issue = Issue {
            id: key.clone(),
            created_at: Utc::now(),
            reporter_task_id: reporter_task_id.map(str::to_owned),
            reporter_worker_id,
            owner_task_id: raw.owner_task_id,
            severity: raw.severity,
            title: raw.title,
            details: raw.details,
            files: sorted_unique_files(&raw.files),
            signature: raw.signature,
            status: IssueStatus::Open,
            occurrences: 1,
        };
        self.issues.insert(key, issue.clone());
        Ok((issue, true))
    }

    /// Update the status of an issue by id.
    pub fn update_status(&mut self, id: &str, status: IssueStatus) -> Result<Issue, IssueError> {
        let issue = self
            .issues
            .get_mut(id)
            .ok_or_else(|| IssueError::UnknownIssue(id.to_owned()))?;
        issue.status = status;
        Ok(issue.clone())
    }

    /// All issues, sorted blocker-first then by creation time.
    pub fn get_all(&self) -> Vec<Issue> {
        let mut out: Vec<Issue> = self.issues.values().cloned().collect();
        out.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.created_at.cmp(&b.created_at))
        });
        out
    }

    pub fn get_open(&self) -> Vec<Issue> {
        self.get_all()
            .into_iter()
            .filter(|i| i.status == IssueStatus::Open)
            .collect()
    }

    pub fn open_blockers(&self) -> Vec<Issue> {
        self.get_open()
            .into_iter()
            .filter(|i| i.severity == IssueSeverity::Blocker)
            .collect()
    }

    pub fn clear(&mut self) {
        self.issues.clear();
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Render the open issues as a Markdown digest for injection into an
    /// integration task's startup prompt. Returns `None` when there is
    /// nothing open.
    pub fn render_digest(&self) -> Option<String> {
        let open = self.get_open();
        if open.is_empty() {
            return None;
        }

        let mut out = String::from("## Open issues from earlier tasks\n");
        for severity in [
            IssueSeverity::Blocker,
            IssueSeverity::Error,
            IssueSeverity::Warning,
        ] {
            let group: Vec<&Issue> = open.iter().filter(|i| i.severity == severity).collect();
            if group.is_empty() {
                continue;
            }
            out.push_str(&format!("\n### {severity}\n"));
            for issue in group {
                out.push_str(&format!("- **{}**", issue.title));
                if !issue.files.is_empty() {
                    out.push_str(&format!(" ({})", issue.files.join(", ")));
                }
                if let Some(ref owner) = issue.owner_task_id {
                    out.push_str(&format!(" [owner: {owner}]"));
                }
                out.push('\n');
                if let Some(ref details) = issue.details {
                    out.push_str(&format!("  - {details}\n"));
                }
            }
        }
        Some(out)
    }

    /// Dump the full open-issues report to a Markdown file.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let open = self.get_open();
        let mut out = format!(
            "# Issue report\n\nGenerated: {}\nOpen issues: {}\n",
            Utc::now().to_rfc3339(),
            open.len()
        );
        for issue in &open {
            out.push_str(&format!(
                "\n## [{}] {}\n\n- id: `{}`\n- status: {}\n- occurrences: {}\n",
                issue.severity, issue.title, issue.id, issue.status, issue.occurrences
            ));
            if !issue.files.is_empty() {
                out.push_str(&format!("- files: {}\n", issue.files.join(", ")));
            }
            if let Some(ref reporter) = issue.reporter_task_id {
                out.push_str(&format!("- reported by: {reporter}\n"));
            }
            if let Some(ref owner) = issue.owner_task_id {
                out.push_str(&format!("- owner: {owner}\n"));
            }
            if let Some(ref details) = issue.details {
                out.push_str(&format!("\n{details}\n"));
            }
        }
        std::fs::write(path, out)
    }
}

/// Merge a duplicate report into an existing issue: bump occurrences,
/// widen severity, union files, re-open `fixed` (but leave `ignored`
/// alone), fill in missing optional fields.
fn merge_into(existing: &mut Issue, raw: RawIssue) {
    existing.occurrences += 1;
    existing.severity = existing.severity.max(raw.severity);

    for file in sorted_unique_files(&raw.files) {
        if !existing.files.contains(&file) {
            existing.files.push(file);
        }
    }
    existing.files.sort();

    if existing.status == IssueStatus::Fixed {
        existing.status = IssueStatus::Open;
    }

    if existing.details.is_none() {
        existing.details = raw.details;
    }
    if existing.owner_task_id.is_none() {
        existing.owner_task_id = raw.owner_task_id;
    }
    if existing.signature.is_none() {
        existing.signature = raw.signature;
    }
}
