//! Serialized plan-file checkbox writeback.
//!
//! Completions flip `- [ ]` to `- [x]` under the task's heading. All
//! updates to one path drain through a single FIFO worker task, so
//! concurrent completions can never interleave read-modify-write cycles
//! on the same file. Different paths proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

/// Outcome of applying a checkbox update to file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckboxUpdate {
    /// Content changed; the new text is returned.
    Updated(String),
    /// The checkbox already carries the target mark.
    AlreadySet,
    /// No matching task heading / checkbox line was found.
    NotFound,
}

/// Flip the first checkbox under `### <task id>` to `[x]` (success) or
/// `[ ]`. Pure function over the whole file content; idempotent.
///
/// The pattern accepts `-`, `*`, and `+` bullets, indentation, an
/// optional `Task:` prefix on the heading, and up to two blank lines
/// between the heading and the first checkbox.
pub fn apply_checkbox_update(content: &str, task_id: &str, success: bool) -> CheckboxUpdate {
    let pattern = format!(
        r"(?m)^(###\s+(?:Task:\s*)?{id}\b[^\n]*\n(?:[ \t]*\r?\n){{0,2}}[ \t]*[-+*]\s+\[)([^\]])(\])",
        id = regex::escape(task_id),
    );
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(task_id, error = %e, "checkbox pattern failed to compile");
            return CheckboxUpdate::NotFound;
        }
    };

    let target = if success { "x" } else { " " };

    let Some(caps) = re.captures(content) else {
        return CheckboxUpdate::NotFound;
    };
    if caps.get(2).map(|m| m.as_str()) == Some(target) {
        return CheckboxUpdate::AlreadySet;
    }

    let updated = re
        .replace(content, |caps: &regex::Captures<'_>| {
            format!("{}{}{}", &caps[1], target, &caps[3])
        })
        .into_owned();
    CheckboxUpdate::Updated(updated)
}

enum WritebackOp {
    Update {
        task_id: String,
        success: bool,
    },
    Flush(oneshot::Sender<()>),
}

/// Per-path FIFO queue of checkbox updates.
#[derive(Debug, Default)]
pub struct WritebackQueue {
    workers: Mutex<HashMap<PathBuf, mpsc::UnboundedSender<WritebackOp>>>,
}

impl WritebackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a checkbox update for `task_id` in `path`. Returns once the
    /// operation is enqueued; the write itself happens on the path's
    /// serial worker. A missing heading is a warning, never a failure.
    pub async fn update_task_checkbox(&self, path: &Path, task_id: &str, success: bool) {
        let tx = self.worker_for(path).await;
        let _ = tx.send(WritebackOp::Update {
            task_id: task_id.to_string(),
            success,
        });
    }

    /// Wait until every queued operation (on every path) has been applied.
    pub async fn flush(&self) {
        let senders: Vec<mpsc::UnboundedSender<WritebackOp>> = {
            let workers = self.workers.lock().await;
            workers.values().cloned().collect()
        };
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WritebackOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    async fn worker_for(&self, path: &Path) -> mpsc::UnboundedSender<WritebackOp> {
        let mut workers = self.workers.lock().await;
        if let Some(tx) = workers.get(path) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        workers.insert(path.to_path_buf(), tx.clone());
        tokio::spawn(run_path_worker(path.to_path_buf(), rx));
        tx
    }
}

/// Serial worker applying all operations for one path in FIFO order.
async fn run_path_worker(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WritebackOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WritebackOp::Update { task_id, success } => {
                apply_update_to_file(&path, &task_id, success).await;
            }
            WritebackOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn apply_update_to_file(path: &Path, task_id: &str, success: bool) {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), task_id, error = %e, "checkbox writeback read failed");
            return;
        }
    };

    match apply_checkbox_update(&content, task_id, success) {
        CheckboxUpdate::Updated(updated) => {
            if let Err(e) = tokio::fs::write(path, updated).await {
                warn!(path = %path.display(), task_id, error = %e, "checkbox writeback write failed");
            } else {
                debug!(path = %path.display(), task_id, success, "checkbox updated");
            }
        }
        CheckboxUpdate::AlreadySet => {
            debug!(path = %path.display(), task_id, "checkbox already in target state");
        }
        CheckboxUpdate::NotFound => {
            warn!(path = %path.display(), task_id, "no checkbox found for task, skipping");
        }
    }
}
