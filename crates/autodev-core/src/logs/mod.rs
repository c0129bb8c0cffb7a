//! Per-task log archival.
//!
//! Each task gets a directory under `<userData>/logs/<normalized id>/`
//! holding one timestamped file per run. Appends for one task drain
//! through a single writer task so concurrent emitters cannot interleave
//! lines. Retention prunes by age first, then oldest-first once the
//! directory exceeds the per-task byte cap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::warn;

/// Default retention by age.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default per-task byte cap.
pub const DEFAULT_TASK_CAP_BYTES: u64 = 5 * 1024 * 1024;

/// Replace characters unsafe for directory names; keeps the id readable.
pub fn normalize_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Escape embedded newlines so one entry is always one line.
fn escape_content(content: &str) -> String {
    content.replace('\r', "\\r").replace('\n', "\\n")
}

enum LogOp {
    Append(String),
    Flush(oneshot::Sender<()>),
}

struct TaskWriter {
    tx: mpsc::UnboundedSender<LogOp>,
    file_path: PathBuf,
}

/// Append-only per-task log store with rotation.
#[derive(Clone)]
pub struct LogArchiver {
    root: PathBuf,
    retention: Duration,
    task_cap_bytes: u64,
    writers: Arc<Mutex<HashMap<String, TaskWriter>>>,
}

impl LogArchiver {
    /// Create an archiver rooted at `<user_data_dir>/logs`.
    pub fn new(user_data_dir: &Path) -> Self {
        Self {
            root: user_data_dir.join("logs"),
            retention: DEFAULT_RETENTION,
            task_cap_bytes: DEFAULT_TASK_CAP_BYTES,
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override retention and size cap (used by tests).
    pub fn with_limits(mut self, retention: Duration, task_cap_bytes: u64) -> Self {
        self.retention = retention;
        self.task_cap_bytes = task_cap_bytes;
        self
    }

    /// Directory holding one task's log files.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(normalize_task_id(task_id))
    }

    /// Open (or reuse) the current run's log file for a task and prune
    /// old files. Returns the log file path.
    pub async fn start_task_log(&self, task_id: &str) -> Result<PathBuf> {
        let mut writers = self.writers.lock().await;
        if let Some(existing) = writers.get(task_id) {
            return Ok(existing.file_path.clone());
        }

        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;

        let file_name = format!("{}.log", Local::now().format("%Y-%m-%d-%H%M%S"));
        let file_path = dir.join(file_name);

        prune_dir(&dir, self.retention, self.task_cap_bytes, &file_path).await;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(file_path.clone(), rx));
        writers.insert(
            task_id.to_string(),
            TaskWriter {
                tx,
                file_path: file_path.clone(),
            },
        );
        Ok(file_path)
    }

    /// Append one entry to a task's current log file. Starts the log
    /// implicitly when needed; failures are logged, never propagated.
    pub async fn append(&self, task_id: &str, entry_type: &str, content: &str) {
        let tx = {
            let writers = self.writers.lock().await;
            writers.get(task_id).map(|w| w.tx.clone())
        };
        let tx = match tx {
            Some(tx) => tx,
            None => {
                if let Err(e) = self.start_task_log(task_id).await {
                    warn!(task_id, error = %e, "failed to start task log");
                    return;
                }
                let writers = self.writers.lock().await;
                match writers.get(task_id) {
                    Some(w) => w.tx.clone(),
                    None => return,
                }
            }
        };

        let line = format!(
            "[{}] [{}] [{}] {}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            Local::now().format("%H:%M:%S"),
            entry_type,
            escape_content(content),
        );
        let _ = tx.send(LogOp::Append(line));
    }

    /// Close a task's writer. Subsequent appends start a fresh file.
    pub async fn finish_task_log(&self, task_id: &str) {
        let writer = {
            let mut writers = self.writers.lock().await;
            writers.remove(task_id)
        };
        if let Some(writer) = writer {
            let (done_tx, done_rx) = oneshot::channel();
            if writer.tx.send(LogOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Wait until all queued appends for a task are on disk.
    pub async fn flush(&self, task_id: &str) {
        let tx = {
            let writers = self.writers.lock().await;
            writers.get(task_id).map(|w| w.tx.clone())
        };
        if let Some(tx) = tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(LogOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Read up to `max_bytes` from the end of the task's most recent log
    /// file. Used by the watchdog's error-token scan.
    pub async fn read_tail(&self, task_id: &str, max_bytes: usize) -> Option<String> {
        self.flush(task_id).await;
        let path = self.latest_log_file(task_id).await?;
        let data = tokio::fs::read(&path).await.ok()?;
        let start = data.len().saturating_sub(max_bytes);
        // Align to a char boundary by lossy conversion.
        Some(String::from_utf8_lossy(&data[start..]).into_owned())
    }

    /// Most recent log file for a task, by file name (names sort by
    /// timestamp).
    pub async fn latest_log_file(&self, task_id: &str) -> Option<PathBuf> {
        {
            let writers = self.writers.lock().await;
            if let Some(w) = writers.get(task_id) {
                return Some(w.file_path.clone());
            }
        }
        let mut names = list_log_files(&self.task_dir(task_id)).await;
        names.sort();
        names.pop()
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogOp>) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open log file");
            // Drain the channel so senders never block on a dead writer.
            while let Some(op) = rx.recv().await {
                if let LogOp::Flush(done) = op {
                    let _ = done.send(());
                }
            }
            return;
        }
    };

    while let Some(op) = rx.recv().await {
        match op {
            LogOp::Append(line) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "log append failed");
                }
            }
            LogOp::Flush(done) => {
                let _ = file.flush().await;
                let _ = done.send(());
            }
        }
    }
    let _ = file.flush().await;
}

async fn list_log_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "log") {
            out.push(path);
        }
    }
    out
}

/// Delete files older than `retention`, then oldest-first while the
/// directory exceeds `cap_bytes`. `current` is never deleted.
async fn prune_dir(dir: &Path, retention: Duration, cap_bytes: u64, current: &Path) {
    let now = SystemTime::now();
    let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

    for path in list_log_files(dir).await {
        if path == current {
            continue;
        }
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        let modified = meta.modified().unwrap_or(now);
        files.push((path, modified, meta.len()));
    }

    // Oldest first.
    files.sort_by_key(|(_, modified, _)| *modified);

    let mut survivors: Vec<(PathBuf, u64)> = Vec::new();
    for (path, modified, len) in files {
        let age = now.duration_since(modified).unwrap_or_default();
        if age > retention {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to prune aged log");
            }
        } else {
            survivors.push((path, len));
        }
    }

    let mut total: u64 = survivors.iter().map(|(_, len)| len).sum();
    for (path, len) in survivors {
        if total <= cap_bytes {
            break;
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to prune oversized log");
        } else {
            total -= len;
        }
    }
}
