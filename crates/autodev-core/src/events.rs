//! Consumer-visible event fan-out.
//!
//! Internal components report state changes to the scheduler, which
//! converts them into [`Notice`] values -- a tagged variant per message
//! named after the wire event (`fileLoaded`, `taskUpdate`, ...). Consumers
//! subscribe through the [`EventBus`] broadcast channel.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::issue::Issue;
use crate::task::Task;

/// Why the scheduler is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PauseReason {
    User,
    Blocker,
    ApiError,
}

/// Kind of a worker log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    System,
    Assistant,
    Tool,
    ToolResult,
    Stderr,
    Info,
    Error,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::ToolResult => "tool_result",
            Self::Stderr => "stderr",
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// One entry in a worker's log buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLogEntry {
    pub at: DateTime<Utc>,
    pub kind: LogKind,
    pub content: String,
}

impl WorkerLogEntry {
    pub fn now(kind: LogKind, content: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            content: content.into(),
        }
    }
}

/// Lifecycle phase of a worker as reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

/// A snapshot of one worker's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStateView {
    pub worker_id: u32,
    pub task_id: Option<String>,
    pub phase: WorkerPhase,
    pub current_tool: Option<String>,
    /// Accumulated token usage, rounded to kilotokens.
    pub kilotokens: u64,
}

/// Aggregate progress counters emitted on every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub canceled: usize,
    pub active_workers: usize,
    pub active_wave: Option<u32>,
}

/// Consumer-visible messages. The serde tag is the wire event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notice {
    FileLoaded {
        path: PathBuf,
        task_count: usize,
        waves: Vec<u32>,
    },
    TaskUpdate {
        task: Task,
    },
    WorkerLog {
        worker_id: u32,
        task_id: Option<String>,
        entry: WorkerLogEntry,
    },
    WorkerState {
        view: WorkerStateView,
    },
    SchedulerState {
        running: bool,
        paused: bool,
        pause_reason: Option<PauseReason>,
        detail: Option<String>,
    },
    Progress {
        summary: ProgressSummary,
    },
    IssueReported {
        issue: Issue,
    },
    IssueUpdate {
        issue: Issue,
    },
    BlockerAutoPause {
        issue: Issue,
        open_blockers: usize,
    },
    ApiError {
        message: String,
        attempt: u32,
        next_retry_in_ms: Option<u64>,
    },
}

/// Broadcast bus for [`Notice`] values. Slow receivers may observe lag;
/// emission itself never blocks the scheduler.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notice>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Publish a notice. A send error only means there are no
    /// subscribers, which is fine.
    pub fn emit(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_serializes_under_wire_names() {
        let notice = Notice::SchedulerState {
            running: true,
            paused: false,
            pause_reason: None,
            detail: None,
        };
        let v: serde_json::Value = serde_json::to_value(&notice).unwrap();
        assert_eq!(v["type"], "schedulerState");
        assert_eq!(v["running"], true);

        let notice = Notice::ApiError {
            message: "overloaded".into(),
            attempt: 2,
            next_retry_in_ms: Some(20_000),
        };
        let v: serde_json::Value = serde_json::to_value(&notice).unwrap();
        assert_eq!(v["type"], "apiError");
        assert_eq!(v["nextRetryInMs"], 20_000);
    }

    #[test]
    fn pause_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&PauseReason::ApiError).unwrap(),
            "\"apiError\""
        );
        assert_eq!(
            serde_json::to_string(&PauseReason::Blocker).unwrap(),
            "\"blocker\""
        );
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(Notice::Progress {
            summary: ProgressSummary::default(),
        });
        let got = rx.recv().await.unwrap();
        assert!(matches!(got, Notice::Progress { .. }));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.emit(Notice::Progress {
            summary: ProgressSummary::default(),
        });
    }
}
