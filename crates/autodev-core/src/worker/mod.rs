//! Worker supervision.
//!
//! A worker owns one child agent process, demultiplexes its JSONL stream
//! into scheduler messages, tracks tool calls and token usage, applies
//! the per-worker watchdog (slow-tool, idle, and hard timeouts), scans
//! for structured issue reports, and terminates the whole process tree
//! when the run ends.

pub mod issue_scan;
pub mod prompt;
pub mod tools;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::Result;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{self, AgentFrame, AgentProcess};
use crate::config::SlowToolTimeouts;
use crate::events::{LogKind, WorkerLogEntry};
use crate::issue::RawIssue;
use crate::resilience::is_api_error_symptom;
use crate::task::canonical_task_id;

use tools::{ToolResultOutcome, ToolTracker, is_write_tool};

/// Upper bound on one logged content payload.
const LOG_CONTENT_MAX: usize = 400;

/// An explicit task-id claim in assistant text, e.g. `Task: BE-2`.
static TASK_CLAIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:current\s+)?(?:task|任务)\s*[:：]\s*(\w+[.-]\w+(?:[.-]\w+)*)").unwrap()
});

/// Current tool state as reported to the scheduler and watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStateView {
    pub name: String,
    pub category: &'static str,
    pub started_at_ms: i64,
}

/// Messages a worker sends to the scheduler loop. All task-state
/// mutation happens on the scheduler; the worker only reports.
#[derive(Debug)]
pub enum WorkerMessage {
    Log {
        worker_id: u32,
        entry: WorkerLogEntry,
    },
    TokenUsage {
        worker_id: u32,
        kilotokens: u64,
    },
    ToolState {
        worker_id: u32,
        current: Option<ToolStateView>,
    },
    IssueReported {
        worker_id: u32,
        raw: RawIssue,
    },
    TaskDetected {
        worker_id: u32,
        task_id: String,
    },
    TaskMismatch {
        worker_id: u32,
        expected: String,
        observed: String,
    },
    ApiErrorSymptom {
        worker_id: u32,
        sample: String,
        has_modified_code: bool,
    },
    Complete {
        worker_id: u32,
        success: bool,
        duration_ms: u64,
        reason: Option<String>,
        has_modified_code: bool,
    },
}

/// Spawn-time configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Per-worker watchdog tick.
    pub tick: Duration,
    /// Idle timeout applied when no slow tool is outstanding.
    pub activity_timeout: Duration,
    /// Optional hard cap on total wall time; deferred while background
    /// tasks are pending.
    pub hard_timeout: Option<Duration>,
    pub slow_tool_timeouts: SlowToolTimeouts,
}

/// Handle to a live worker, owned by the scheduler.
#[derive(Debug)]
pub struct WorkerHandle {
    pub worker_id: u32,
    pub task_id: String,
    pub pid: u32,
    cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request termination. Idempotent; the worker's loop performs the
    /// actual process-tree kill.
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

/// Spawn a worker: launch the agent child, dispatch the startup prompt
/// as a single user message, and start the supervision loop.
///
/// Lock acquisition is the scheduler's job and happens before this call.
pub async fn spawn_worker(
    worker_id: u32,
    task_id: String,
    startup_prompt: String,
    config: WorkerConfig,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) -> Result<WorkerHandle> {
    let mut process = agent::launch(&config.binary, &config.args, &config.cwd, &config.env)?;
    let pid = process.pid;

    if let Err(e) = process.send_user_message(&startup_prompt).await {
        process.kill_tree().await;
        return Err(e);
    }

    let cancel = CancellationToken::new();
    let join = tokio::spawn(run_worker_loop(
        worker_id,
        task_id.clone(),
        process,
        config,
        tx,
        cancel.clone(),
    ));

    Ok(WorkerHandle {
        worker_id,
        task_id,
        pid,
        cancel,
        join,
    })
}

struct WorkerState {
    worker_id: u32,
    task_id: String,
    tracker: ToolTracker,
    last_activity: Instant,
    started: Instant,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    has_write_tool: bool,
    last_tool_report: Option<String>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerState {
    fn send(&self, message: WorkerMessage) {
        let _ = self.tx.send(message);
    }

    fn log(&self, kind: LogKind, content: impl Into<String>) {
        let mut content = content.into();
        if content.len() > LOG_CONTENT_MAX {
            let mut cut = LOG_CONTENT_MAX;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("...");
        }
        self.send(WorkerMessage::Log {
            worker_id: self.worker_id,
            entry: WorkerLogEntry::now(kind, content),
        });
    }

    fn kilotokens(&self) -> u64 {
        let total = self.input_tokens + self.output_tokens + self.cache_read_tokens;
        (total + 500) / 1000
    }

    /// Report the current slow tool when it changed.
    fn report_tool_state(&mut self) {
        let current = self.tracker.current_slow().map(|call| ToolStateView {
            name: call.name.clone(),
            category: call.category.as_str(),
            started_at_ms: chrono::Utc::now().timestamp_millis()
                - call.started.elapsed().as_millis() as i64,
        });
        let key = current.as_ref().map(|c| c.name.clone());
        if key != self.last_tool_report {
            self.last_tool_report = key;
            self.send(WorkerMessage::ToolState {
                worker_id: self.worker_id,
                current,
            });
        }
    }

    fn complete(&self, success: bool, duration_ms: u64, reason: Option<String>) {
        self.send(WorkerMessage::Complete {
            worker_id: self.worker_id,
            success,
            duration_ms,
            reason,
            has_modified_code: self.has_write_tool,
        });
    }

    fn check_api_symptom(&self, text: &str) {
        if is_api_error_symptom(text) {
            let sample: String = text.chars().take(200).collect();
            self.send(WorkerMessage::ApiErrorSymptom {
                worker_id: self.worker_id,
                sample,
                has_modified_code: self.has_write_tool,
            });
        }
    }

    /// Scan assistant text for an explicit task-id claim. The assigned
    /// id is trusted; a different claim is a mismatch that kills the
    /// worker.
    fn check_task_claim(&self, text: &str) -> Option<String> {
        let claim = TASK_CLAIM_RE
            .captures(text)
            .map(|caps| canonical_task_id(caps.get(1).unwrap().as_str()))?;
        if claim == self.task_id {
            self.send(WorkerMessage::TaskDetected {
                worker_id: self.worker_id,
                task_id: claim,
            });
            None
        } else {
            Some(claim)
        }
    }
}

enum LineVerdict {
    Continue,
    /// Terminal result seen; the worker should self-kill.
    Finished,
    /// A fatal condition (task mismatch); kill and fail.
    Fatal(String),
}

async fn run_worker_loop(
    worker_id: u32,
    task_id: String,
    mut process: AgentProcess,
    config: WorkerConfig,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    cancel: CancellationToken,
) {
    let stdout = match process.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = tx.send(WorkerMessage::Complete {
                worker_id,
                success: false,
                duration_ms: 0,
                reason: Some("agent stdout unavailable".to_string()),
                has_modified_code: false,
            });
            return;
        }
    };
    let mut lines = BufReader::new(stdout).lines();

    // Stderr is unstructured; forward it on a side task.
    if let Some(stderr) = process.stderr.take() {
        let stderr_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = stderr_tx.send(WorkerMessage::Log {
                    worker_id,
                    entry: WorkerLogEntry::now(LogKind::Stderr, line.clone()),
                });
                if is_api_error_symptom(&line) {
                    let _ = stderr_tx.send(WorkerMessage::ApiErrorSymptom {
                        worker_id,
                        sample: line.chars().take(200).collect(),
                        has_modified_code: false,
                    });
                }
            }
        });
    }

    let mut state = WorkerState {
        worker_id,
        task_id,
        tracker: ToolTracker::new(config.slow_tool_timeouts),
        last_activity: Instant::now(),
        started: Instant::now(),
        input_tokens: 0,
        output_tokens: 0,
        cache_read_tokens: 0,
        has_write_tool: false,
        last_tool_report: None,
        tx,
    };

    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        state.last_activity = Instant::now();
                        match handle_line(&mut state, &line) {
                            LineVerdict::Continue => {}
                            LineVerdict::Finished => break,
                            LineVerdict::Fatal(reason) => {
                                state.log(LogKind::Error, reason.clone());
                                state.complete(
                                    false,
                                    state.started.elapsed().as_millis() as u64,
                                    Some(reason),
                                );
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        // Stream closed without a result frame.
                        state.log(LogKind::Error, "agent stream closed without result");
                        state.complete(
                            false,
                            state.started.elapsed().as_millis() as u64,
                            Some("stream closed".to_string()),
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(worker_id, error = %e, "error reading agent stdout");
                        state.complete(
                            false,
                            state.started.elapsed().as_millis() as u64,
                            Some(format!("stdout read error: {e}")),
                        );
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if let Some(reason) = watchdog_check(&state, &config) {
                    state.log(LogKind::Error, reason.clone());
                    state.complete(
                        false,
                        state.started.elapsed().as_millis() as u64,
                        Some(reason),
                    );
                    break;
                }
            }

            _ = cancel.cancelled() => {
                state.log(LogKind::Info, "worker killed");
                state.complete(
                    false,
                    state.started.elapsed().as_millis() as u64,
                    Some("killed".to_string()),
                );
                break;
            }
        }
    }

    process.kill_tree().await;
    debug!(worker_id, "worker loop finished");
}

/// Per-worker watchdog semantics: a finite-timeout slow tool that aged
/// out kills the worker; an active slow tool otherwise defers the idle
/// check; the hard cap always applies unless background tasks pend.
fn watchdog_check(state: &WorkerState, config: &WorkerConfig) -> Option<String> {
    let now = Instant::now();

    if state.tracker.current_slow().is_some() {
        if let Some((call, elapsed)) = state.tracker.slow_timeout_exceeded(now) {
            return Some(format!(
                "Timeout: slow tool {} ({}) ran for {}s",
                call.name,
                call.category.as_str(),
                elapsed.as_secs()
            ));
        }
    } else if now.duration_since(state.last_activity) > config.activity_timeout {
        return Some(format!(
            "Timeout: no activity for {}s",
            now.duration_since(state.last_activity).as_secs()
        ));
    }

    if let Some(hard) = config.hard_timeout {
        if now.duration_since(state.started) > hard && !state.tracker.has_pending_background() {
            return Some(format!(
                "Timeout: hard cap of {}s exceeded",
                hard.as_secs()
            ));
        }
    }

    None
}

fn handle_line(state: &mut WorkerState, line: &str) -> LineVerdict {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineVerdict::Continue;
    }

    // Issue marker lines are plain text, not frames.
    if let Some(raw) = issue_scan::scan_line(trimmed) {
        state.log(LogKind::Info, format!("issue reported: {}", raw.title));
        state.send(WorkerMessage::IssueReported {
            worker_id: state.worker_id,
            raw,
        });
        return LineVerdict::Continue;
    }

    let frames = match agent::parse_line(trimmed) {
        Ok(frames) => frames,
        Err(_) => {
            state.log(LogKind::System, format!("unparseable line: {trimmed}"));
            return LineVerdict::Continue;
        }
    };

    for frame in frames {
        match frame {
            AgentFrame::System { subtype, session_id } => {
                state.log(
                    LogKind::System,
                    format!(
                        "system {} {}",
                        subtype.as_deref().unwrap_or("-"),
                        session_id.as_deref().unwrap_or("-")
                    ),
                );
            }

            AgentFrame::AssistantText { text } => {
                state.log(LogKind::Assistant, text.clone());
                for raw in issue_scan::scan_text(&text) {
                    state.send(WorkerMessage::IssueReported {
                        worker_id: state.worker_id,
                        raw,
                    });
                }
                state.check_api_symptom(&text);
                if let Some(observed) = state.check_task_claim(&text) {
                    state.send(WorkerMessage::TaskMismatch {
                        worker_id: state.worker_id,
                        expected: state.task_id.clone(),
                        observed: observed.clone(),
                    });
                    return LineVerdict::Fatal(format!(
                        "task mismatch: assigned {} but agent claims {}",
                        state.task_id, observed
                    ));
                }
            }

            AgentFrame::ToolUse { id, name, input } => {
                let call = state.tracker.on_tool_use(&id, &name, &input);
                if is_write_tool(&name) {
                    state.has_write_tool = true;
                }
                state.log(
                    LogKind::Tool,
                    format!("{} [{}] {}", call.name, call.category.as_str(), input),
                );
                state.report_tool_state();
            }

            AgentFrame::ToolResult { tool_use_id, content } => {
                match state.tracker.on_tool_result(&tool_use_id, &content) {
                    ToolResultOutcome::Finished { name } => {
                        state.log(LogKind::ToolResult, format!("{name} finished"));
                    }
                    ToolResultOutcome::BackgroundLaunched { name, background_id } => {
                        state.log(
                            LogKind::ToolResult,
                            format!("{name} launched background task {background_id}"),
                        );
                    }
                    ToolResultOutcome::BackgroundLostTrack { name } => {
                        state.log(
                            LogKind::ToolResult,
                            format!("{name} launched a background task with no id"),
                        );
                    }
                    ToolResultOutcome::BackgroundDrained { ids } => {
                        if !ids.is_empty() {
                            state.log(
                                LogKind::ToolResult,
                                format!("background tasks finished: {}", ids.join(", ")),
                            );
                        }
                    }
                    ToolResultOutcome::Unmatched => {
                        debug!(worker_id = state.worker_id, tool_use_id, "unmatched tool_result");
                    }
                }
                for raw in issue_scan::scan_text(&content) {
                    state.send(WorkerMessage::IssueReported {
                        worker_id: state.worker_id,
                        raw,
                    });
                }
                state.report_tool_state();
            }

            AgentFrame::Usage {
                input_tokens,
                output_tokens,
                cache_read_tokens,
            } => {
                state.input_tokens += input_tokens;
                state.output_tokens += output_tokens;
                state.cache_read_tokens += cache_read_tokens;
                state.send(WorkerMessage::TokenUsage {
                    worker_id: state.worker_id,
                    kilotokens: state.kilotokens(),
                });
            }

            AgentFrame::Result {
                success,
                subtype,
                duration_ms,
                text,
            } => {
                if let Some(ref text) = text {
                    state.check_api_symptom(text);
                }
                if !success {
                    state.check_api_symptom(&subtype);
                }
                let duration =
                    duration_ms.unwrap_or_else(|| state.started.elapsed().as_millis() as u64);
                state.log(
                    LogKind::Info,
                    format!("result {subtype} after {duration}ms"),
                );
                state.complete(success, duration, (!success).then(|| subtype.clone()));
                return LineVerdict::Finished;
            }

            AgentFrame::Unknown { frame_type } => {
                state.log(LogKind::System, format!("unknown frame type: {frame_type}"));
            }
        }
    }

    LineVerdict::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &std::path::Path, binary: &str) -> WorkerConfig {
        WorkerConfig {
            binary: binary.to_string(),
            args: vec![],
            cwd: dir.to_path_buf(),
            env: HashMap::new(),
            tick: Duration::from_millis(50),
            activity_timeout: Duration::from_secs(60),
            hard_timeout: None,
            slow_tool_timeouts: SlowToolTimeouts::default(),
        }
    }

    fn write_script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    async fn drain_until_complete(
        rx: &mut mpsc::UnboundedReceiver<WorkerMessage>,
    ) -> (Vec<WorkerMessage>, bool) {
        let mut messages = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("worker should finish within 5s")
                .expect("channel open");
            let done = matches!(&msg, WorkerMessage::Complete { .. });
            let success = matches!(&msg, WorkerMessage::Complete { success: true, .. });
            messages.push(msg);
            if done {
                return (messages, success);
            }
        }
    }

    #[tokio::test]
    async fn successful_run_emits_complete_true() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "#!/bin/sh\nread _prompt\n\
             echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s1\"}'\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}],\"usage\":{\"input_tokens\":1200,\"output_tokens\":300}}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":10}'\n",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            1,
            "BE-1".to_string(),
            "do the task".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        let (messages, success) = drain_until_complete(&mut rx).await;
        assert!(success);
        assert!(messages.iter().any(|m| matches!(m, WorkerMessage::TokenUsage { kilotokens, .. } if *kilotokens >= 1)));
        assert!(messages.iter().any(|m| matches!(m, WorkerMessage::Log { entry, .. } if entry.kind == LogKind::Assistant)));
        handle.join.await.unwrap();
    }

    #[tokio::test]
    async fn failure_result_emits_complete_false_with_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "#!/bin/sh\nread _prompt\n\
             echo '{\"type\":\"result\",\"subtype\":\"error_max_turns\",\"duration_ms\":5}'\n",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(
            2,
            "BE-1".to_string(),
            "p".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        let (messages, success) = drain_until_complete(&mut rx).await;
        assert!(!success);
        let Some(WorkerMessage::Complete { reason, .. }) = messages.last() else {
            panic!("last message must be Complete");
        };
        assert_eq!(reason.as_deref(), Some("error_max_turns"));
    }

    #[tokio::test]
    async fn stream_close_without_result_is_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "#!/bin/sh\nread _prompt\necho '{\"type\":\"system\"}'\n",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(
            3,
            "BE-1".to_string(),
            "p".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        let (messages, success) = drain_until_complete(&mut rx).await;
        assert!(!success);
        let Some(WorkerMessage::Complete { reason, .. }) = messages.last() else {
            panic!("expected Complete");
        };
        assert_eq!(reason.as_deref(), Some("stream closed"));
    }

    #[tokio::test]
    async fn issue_marker_lines_are_forwarded() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "#!/bin/sh\nread _prompt\n\
             echo 'AUTO_DEV_ISSUE: {\"title\":\"broken\",\"severity\":\"blocker\",\"files\":[\"x.ts\"]}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(
            4,
            "BE-1".to_string(),
            "p".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        let (messages, success) = drain_until_complete(&mut rx).await;
        assert!(success, "issue reporting must not fail the task");
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::IssueReported { raw, .. } if raw.title == "broken"
        )));
    }

    #[tokio::test]
    async fn task_mismatch_kills_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "#!/bin/sh\nread _prompt\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Task: FE-9\\nstarting now\"}]}}'\n\
             sleep 600\n",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(
            5,
            "BE-1".to_string(),
            "p".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        let (messages, success) = drain_until_complete(&mut rx).await;
        assert!(!success);
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::TaskMismatch { observed, .. } if observed == "FE-9"
        )));
    }

    #[tokio::test]
    async fn idle_timeout_kills_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "#!/bin/sh\nread _prompt\nsleep 600\n");
        let mut config = test_config(tmp.path(), &script);
        config.activity_timeout = Duration::from_millis(100);
        config.tick = Duration::from_millis(30);

        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(6, "BE-1".to_string(), "p".to_string(), config, tx)
            .await
            .unwrap();

        let (messages, success) = drain_until_complete(&mut rx).await;
        assert!(!success);
        let Some(WorkerMessage::Complete { reason, .. }) = messages.last() else {
            panic!("expected Complete");
        };
        assert!(reason.as_deref().unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn kill_cancels_promptly() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "#!/bin/sh\nread _prompt\nsleep 600\n");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            7,
            "BE-1".to_string(),
            "p".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        handle.kill();
        let (_messages, success) = drain_until_complete(&mut rx).await;
        assert!(!success);
        handle.join.await.unwrap();
    }

    #[tokio::test]
    async fn api_error_symptom_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "#!/bin/sh\nread _prompt\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"upstream returned overloaded_error, cannot continue\"}]}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"error_api\"}'\n",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(
            8,
            "BE-1".to_string(),
            "p".to_string(),
            test_config(tmp.path(), &script),
            tx,
        )
        .await
        .unwrap();

        let (messages, _success) = drain_until_complete(&mut rx).await;
        assert!(messages.iter().any(|m| matches!(m, WorkerMessage::ApiErrorSymptom { .. })));
    }

    #[test]
    fn watchdog_defers_idle_check_while_slow_tool_active() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut state = WorkerState {
            worker_id: 1,
            task_id: "BE-1".to_string(),
            tracker: ToolTracker::new(SlowToolTimeouts::default()),
            last_activity: Instant::now(),
            started: Instant::now(),
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            has_write_tool: false,
            last_tool_report: None,
            tx,
        };
        let config = WorkerConfig {
            binary: "x".into(),
            args: vec![],
            cwd: PathBuf::from("."),
            env: HashMap::new(),
            tick: Duration::from_secs(1),
            activity_timeout: Duration::from_millis(5),
            hard_timeout: None,
            slow_tool_timeouts: SlowToolTimeouts::default(),
        };

        // Stale activity with no slow tool: idle timeout fires.
        std::thread::sleep(Duration::from_millis(20));
        assert!(watchdog_check(&state, &config).is_some());

        // An active codex call (60 min timeout) defers the idle check.
        state
            .tracker
            .on_tool_use("tu_1", "Bash", &json!({"command": "codex exec"}));
        assert!(watchdog_check(&state, &config).is_none());
    }

    #[test]
    fn task_claim_pattern_matches_declarations_only() {
        let caps = TASK_CLAIM_RE.captures("Task: BE-2").unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "BE-2");
        assert!(TASK_CLAIM_RE.captures("depends on BE-2 and FE-1").is_none());
        let caps = TASK_CLAIM_RE.captures("任务：FE-3").unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "FE-3");
    }
}
