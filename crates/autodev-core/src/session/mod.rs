//! Session persistence.
//!
//! One JSON snapshot per plan file, keyed by a SHA-1 prefix of the
//! absolute path, written atomically (`.tmp` + fsync, main renamed to
//! `.bak`, `.tmp` renamed to main). A debounced flush coalesces bursts of
//! persist requests; a nonce ties pending timers to the plan generation
//! so a reload abandons writes scheduled for the previous plan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::config::AutoRetryConfig;
use crate::events::PauseReason;
use crate::issue::Issue;
use crate::task::{Task, TaskStatus};

/// Current snapshot schema version. Snapshots with any other version are
/// discarded on load.
pub const SESSION_VERSION: u32 = 1;

/// Debounce window for coalescing persist requests.
pub const DEBOUNCE: Duration = Duration::from_millis(750);

/// Saved runtime state for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntimeState {
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub api_error_retry_count: u32,
    pub is_api_error_recovery: bool,
    pub has_modified_code: bool,
}

impl TaskRuntimeState {
    pub fn of(task: &Task) -> Self {
        Self {
            status: task.status,
            start_time: task.start_time,
            end_time: task.end_time,
            duration_secs: task.duration_secs,
            retry_count: task.retry_count,
            next_retry_at: task.next_retry_at,
            api_error_retry_count: task.api_error_retry_count,
            is_api_error_recovery: task.is_api_error_recovery,
            has_modified_code: task.has_modified_code,
        }
    }

    fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Success | TaskStatus::Canceled => true,
            TaskStatus::Failed => self.next_retry_at.is_none(),
            _ => false,
        }
    }
}

/// Versioned per-plan session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub plan_path: PathBuf,
    pub project_root: PathBuf,
    pub paused: bool,
    pub pause_reason: Option<PauseReason>,
    pub auto_retry: AutoRetryConfig,
    pub blocker_auto_pause_enabled: bool,
    pub tasks: BTreeMap<String, TaskRuntimeState>,
    pub issues: Vec<Issue>,
}

/// Session-file key: SHA-1 of the absolute path (lower-cased on Windows,
/// where paths are case-insensitive), truncated to 16 hex chars.
pub fn session_key(plan_path: &Path) -> String {
    let absolute = std::path::absolute(plan_path).unwrap_or_else(|_| plan_path.to_path_buf());
    let mut text = absolute.to_string_lossy().into_owned();
    if cfg!(windows) {
        text = text.to_lowercase();
    }
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Merge a saved task state into the freshly parsed task, respecting the
/// plan file as the source of truth for terminal states:
///
/// - file `success` wins over anything the session says;
/// - file terminal wins over a non-terminal session state;
/// - file non-terminal wins over a terminal session state (the operator
///   re-opened the task by hand);
/// - when the file and the session agree on the same terminal state, the
///   session's timing fields are restored so durations survive reloads;
/// - otherwise the session's runtime state is adopted wholesale.
pub fn merge_task_state(task: &mut Task, saved: &TaskRuntimeState) {
    if task.is_terminal() {
        if task.status == saved.status {
            task.start_time = saved.start_time;
            task.end_time = saved.end_time;
            task.duration_secs = saved.duration_secs;
        }
        return;
    }
    if saved.is_terminal() {
        return;
    }
    task.status = saved.status;
    task.start_time = saved.start_time;
    task.end_time = saved.end_time;
    task.duration_secs = saved.duration_secs;
    task.retry_count = saved.retry_count;
    task.next_retry_at = saved.next_retry_at;
    task.api_error_retry_count = saved.api_error_retry_count;
    task.is_api_error_recovery = saved.is_api_error_recovery;
    task.has_modified_code = saved.has_modified_code;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct DebounceState {
    nonce: u64,
    pending: Option<SessionSnapshot>,
    timer_armed: bool,
}

/// Debounced, atomic session store.
#[derive(Clone)]
pub struct SessionStore {
    dir: PathBuf,
    debounce: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl SessionStore {
    pub fn new(user_data_dir: &Path) -> Self {
        Self {
            dir: user_data_dir.join("sessions"),
            debounce: DEBOUNCE,
            state: Arc::new(Mutex::new(DebounceState {
                nonce: 0,
                pending: None,
                timer_armed: false,
            })),
        }
    }

    /// Shorten the debounce window (used by tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn paths_for(&self, plan_path: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let main = self.dir.join(format!("{}.json", session_key(plan_path)));
        let tmp = main.with_extension("json.tmp");
        let bak = main.with_extension("json.bak");
        (main, tmp, bak)
    }

    /// Invalidate any pending debounce timer. Called when a new plan is
    /// loaded so writes scheduled for the old plan are abandoned.
    pub fn bump_nonce(&self) {
        let mut state = self.state.lock().expect("session store lock poisoned");
        state.nonce += 1;
        state.pending = None;
    }

    /// Request a debounced persist. Fast-follow requests within the
    /// debounce window coalesce into one write of the latest snapshot.
    pub fn persist_later(&self, snapshot: SessionSnapshot) {
        let (nonce, arm) = {
            let mut state = self.state.lock().expect("session store lock poisoned");
            state.pending = Some(snapshot);
            let arm = !state.timer_armed;
            state.timer_armed = true;
            (state.nonce, arm)
        };
        if !arm {
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(store.debounce).await;
            let snapshot = {
                let mut state = store.state.lock().expect("session store lock poisoned");
                state.timer_armed = false;
                if state.nonce != nonce {
                    // A load raced this timer; abandon the stale write.
                    return;
                }
                state.pending.take()
            };
            if let Some(snapshot) = snapshot {
                if let Err(e) = store.write_now(&snapshot) {
                    warn!(error = %e, "session persist failed");
                }
            }
        });
    }

    /// Flush any pending snapshot immediately.
    pub fn flush(&self) {
        let snapshot = {
            let mut state = self.state.lock().expect("session store lock poisoned");
            state.pending.take()
        };
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.write_now(&snapshot) {
                warn!(error = %e, "session flush failed");
            }
        }
    }

    /// Write a snapshot atomically: serialize to `.tmp` (fsync), move the
    /// current main aside to `.bak` (best-effort), rename `.tmp` to main.
    pub fn write_now(&self, snapshot: &SessionSnapshot) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let (main, tmp, bak) = self.paths_for(&snapshot.plan_path);

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }

        if main.exists() {
            if let Err(e) = std::fs::rename(&main, &bak) {
                warn!(error = %e, "failed to rotate session backup");
            }
        }
        std::fs::rename(&tmp, &main)?;
        debug!(path = %main.display(), "session snapshot written");
        Ok(())
    }

    /// Load the snapshot for a plan, trying main, then `.bak`, then
    /// `.tmp`. Unreadable or version-mismatched candidates are skipped.
    pub fn load(&self, plan_path: &Path) -> Option<SessionSnapshot> {
        let (main, tmp, bak) = self.paths_for(plan_path);
        for candidate in [main, bak, tmp] {
            let Ok(bytes) = std::fs::read(&candidate) else {
                continue;
            };
            match serde_json::from_slice::<SessionSnapshot>(&bytes) {
                Ok(snapshot) if snapshot.version == SESSION_VERSION => return Some(snapshot),
                Ok(snapshot) => {
                    warn!(
                        path = %candidate.display(),
                        version = snapshot.version,
                        "discarding session snapshot with unknown version"
                    );
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "unreadable session snapshot");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(plan_path: &Path) -> SessionSnapshot {
        SessionSnapshot {
            version: SESSION_VERSION,
            saved_at: Utc::now(),
            plan_path: plan_path.to_path_buf(),
            project_root: PathBuf::from("/tmp/project"),
            paused: false,
            pause_reason: None,
            auto_retry: AutoRetryConfig::default(),
            blocker_auto_pause_enabled: true,
            tasks: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    #[test]
    fn session_key_is_16_hex_chars_and_stable() {
        let a = session_key(Path::new("/tmp/AUTO-DEV.md"));
        let b = session_key(Path::new("/tmp/AUTO-DEV.md"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, session_key(Path::new("/tmp/OTHER.md")));
    }

    #[test]
    fn write_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let plan = tmp.path().join("AUTO-DEV.md");

        let mut snap = snapshot(&plan);
        snap.tasks.insert(
            "BE-1".to_string(),
            TaskRuntimeState {
                status: TaskStatus::Success,
                start_time: None,
                end_time: None,
                duration_secs: Some(12),
                retry_count: 1,
                next_retry_at: None,
                api_error_retry_count: 0,
                is_api_error_recovery: false,
                has_modified_code: true,
            },
        );
        store.write_now(&snap).unwrap();

        let loaded = store.load(&plan).unwrap();
        assert_eq!(loaded.tasks["BE-1"].duration_secs, Some(12));
        assert!(loaded.tasks["BE-1"].has_modified_code);
    }

    #[test]
    fn rewrite_keeps_a_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let plan = tmp.path().join("AUTO-DEV.md");

        store.write_now(&snapshot(&plan)).unwrap();
        store.write_now(&snapshot(&plan)).unwrap();

        let (main, _tmp_path, bak) = store.paths_for(&plan);
        assert!(main.exists());
        assert!(bak.exists());
    }

    #[test]
    fn load_falls_back_to_backup_when_main_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let plan = tmp.path().join("AUTO-DEV.md");

        store.write_now(&snapshot(&plan)).unwrap();
        store.write_now(&snapshot(&plan)).unwrap();

        let (main, _, _) = store.paths_for(&plan);
        std::fs::write(&main, b"{ not json").unwrap();

        assert!(store.load(&plan).is_some(), "backup should be used");
    }

    #[test]
    fn version_mismatch_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let plan = tmp.path().join("AUTO-DEV.md");

        let mut snap = snapshot(&plan);
        snap.version = 99;
        store.write_now(&snap).unwrap();

        assert!(store.load(&plan).is_none());
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(store.load(Path::new("/nonexistent/plan.md")).is_none());
    }

    #[tokio::test]
    async fn debounce_coalesces_fast_follow_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).with_debounce(Duration::from_millis(30));
        let plan = tmp.path().join("AUTO-DEV.md");

        let mut first = snapshot(&plan);
        first.paused = false;
        let mut second = snapshot(&plan);
        second.paused = true;

        store.persist_later(first);
        store.persist_later(second);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let loaded = store.load(&plan).unwrap();
        assert!(loaded.paused, "latest snapshot wins the coalesced write");
    }

    #[tokio::test]
    async fn nonce_bump_abandons_pending_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).with_debounce(Duration::from_millis(30));
        let plan = tmp.path().join("AUTO-DEV.md");

        store.persist_later(snapshot(&plan));
        store.bump_nonce();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(store.load(&plan).is_none(), "stale write must not land");
    }

    // -- hydrate merge rules ------------------------------------------------

    fn saved(status: TaskStatus) -> TaskRuntimeState {
        TaskRuntimeState {
            status,
            start_time: None,
            end_time: None,
            duration_secs: Some(33),
            retry_count: 2,
            next_retry_at: None,
            api_error_retry_count: 1,
            is_api_error_recovery: true,
            has_modified_code: true,
        }
    }

    #[test]
    fn file_success_beats_session() {
        let mut task = Task::new("BE-1", "t");
        task.status = TaskStatus::Success;
        merge_task_state(&mut task, &saved(TaskStatus::Failed));
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.duration_secs, None, "nothing else is adopted");
    }

    #[test]
    fn matching_terminal_states_restore_timing() {
        let mut task = Task::new("BE-1", "t");
        task.status = TaskStatus::Success;
        merge_task_state(&mut task, &saved(TaskStatus::Success));
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.duration_secs, Some(33), "duration survives reload");
        assert_eq!(task.retry_count, 0, "retry bookkeeping is not adopted");
    }

    #[test]
    fn file_terminal_beats_non_terminal_session() {
        let mut task = Task::new("BE-1", "t");
        task.status = TaskStatus::Failed;
        merge_task_state(&mut task, &saved(TaskStatus::Running));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn file_non_terminal_beats_terminal_session() {
        // The operator re-opened the task in the plan file.
        let mut task = Task::new("BE-1", "t");
        task.status = TaskStatus::Ready;
        merge_task_state(&mut task, &saved(TaskStatus::Success));
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn both_non_terminal_adopts_session_state() {
        let mut task = Task::new("BE-1", "t");
        task.status = TaskStatus::Ready;

        let mut s = saved(TaskStatus::Failed);
        s.next_retry_at = Some(123); // failed-with-retry is non-terminal
        merge_task_state(&mut task, &s);

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.next_retry_at, Some(123));
        assert_eq!(task.retry_count, 2);
        assert!(task.has_modified_code);
        assert!(task.is_api_error_recovery);
        assert_eq!(task.duration_secs, Some(33));
    }
}
