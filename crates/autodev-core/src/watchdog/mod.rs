//! Out-of-band worker health diagnosis.
//!
//! The watchdog keeps its own registry of live workers and periodically
//! diagnoses each one with cheap rules: process liveness, clear error
//! tokens in the log tail, per-tool-call aging, and whole-worker
//! inactivity. Ambiguous cases can escalate to an isolated AI diagnosis
//! call. A `Restart` verdict invokes the caller-supplied restart handler;
//! every decision is appended to a JSON-lines operation log for audit.

pub mod ai;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchdogConfig;
use crate::logs::LogArchiver;

/// Bytes of log tail scanned for error tokens.
const LOG_TAIL_BYTES: usize = 256 * 1024;

/// Clear-error tokens that justify an immediate restart.
const ERROR_TOKENS: &[&str] = &["504", "timeout", "econnreset", "etimedout"];

/// Diagnosis outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Restart,
    Wait,
    NeedAi,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Restart => "restart",
            Self::Wait => "wait",
            Self::NeedAi => "need_ai",
        };
        f.write_str(s)
    }
}

impl FromStr for Verdict {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "wait" => Ok(Self::Wait),
            "need_ai" => Ok(Self::NeedAi),
            _ => Err(()),
        }
    }
}

/// Slow-tool state mirrored from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowToolProbe {
    pub name: String,
    pub category: String,
    pub started_at_ms: i64,
}

/// Registry entry for one worker.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    pub worker_id: u32,
    pub pid: u32,
    pub task_id: String,
    pub last_activity_ms: i64,
    pub slow_tool: Option<SlowToolProbe>,
}

/// One audited decision.
#[derive(Debug, Serialize, Deserialize)]
struct OpRecord {
    ts: String,
    worker_id: u32,
    pid: u32,
    task_id: String,
    verdict: Verdict,
    reason: String,
    source: String,
}

/// Restart handler supplied by the scheduler (typically a worker kill).
pub type RestartHandler = Arc<dyn Fn(u32, String) + Send + Sync>;

/// Out-of-band watchdog.
pub struct Watchdog {
    config: WatchdogConfig,
    registry: Arc<Mutex<HashMap<u32, WorkerProbe>>>,
    archiver: LogArchiver,
    oplog_path: PathBuf,
    /// Agent binary used by the AI diagnosis layer.
    agent_binary: String,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        archiver: LogArchiver,
        user_data_dir: &std::path::Path,
        agent_binary: String,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            archiver,
            oplog_path: user_data_dir.join("watchdog").join("ops.jsonl"),
            agent_binary,
        }
    }

    pub fn register(&self, probe: WorkerProbe) {
        self.registry
            .lock()
            .expect("watchdog registry poisoned")
            .insert(probe.worker_id, probe);
    }

    pub fn unregister(&self, worker_id: u32) {
        self.registry
            .lock()
            .expect("watchdog registry poisoned")
            .remove(&worker_id);
    }

    /// Record fresh activity for a worker.
    pub fn touch(&self, worker_id: u32) {
        if let Some(probe) = self
            .registry
            .lock()
            .expect("watchdog registry poisoned")
            .get_mut(&worker_id)
        {
            probe.last_activity_ms = Utc::now().timestamp_millis();
        }
    }

    /// Mirror the worker's current slow-tool state.
    pub fn set_slow_tool(&self, worker_id: u32, slow_tool: Option<SlowToolProbe>) {
        if let Some(probe) = self
            .registry
            .lock()
            .expect("watchdog registry poisoned")
            .get_mut(&worker_id)
        {
            probe.slow_tool = slow_tool;
        }
    }

    /// Start the periodic diagnosis loop.
    pub fn start(self: Arc<Self>, restart: RestartHandler, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.check_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_check(&restart).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Diagnose every registered worker once.
    pub async fn run_check(&self, restart: &RestartHandler) {
        let probes: Vec<WorkerProbe> = {
            let registry = self.registry.lock().expect("watchdog registry poisoned");
            registry.values().cloned().collect()
        };

        for probe in probes {
            let tail = self.archiver.read_tail(&probe.task_id, LOG_TAIL_BYTES).await;
            let (mut verdict, mut reason) = self.rule_diagnose(&probe, tail.as_deref());
            let mut source = "rule";

            if verdict == Verdict::NeedAi && self.config.ai_enabled {
                source = "ai";
                let prompt = ai::build_prompt(&probe, tail.as_deref());
                match ai::diagnose(
                    &self.agent_binary,
                    &prompt,
                    Duration::from_millis(self.config.ai_timeout_ms),
                )
                .await
                {
                    Ok(decision) => {
                        verdict = decision.action;
                        reason = decision.reason;
                    }
                    Err(e) => {
                        warn!(worker_id = probe.worker_id, error = %e, "AI diagnosis failed");
                        verdict = Verdict::NeedAi;
                        reason = format!("ai diagnosis failed: {e}");
                    }
                }
            }

            self.append_op(&probe, verdict, &reason, source);

            match verdict {
                Verdict::Restart => {
                    info!(
                        worker_id = probe.worker_id,
                        task_id = %probe.task_id,
                        reason = %reason,
                        "watchdog restarting worker"
                    );
                    restart(probe.worker_id, reason);
                }
                Verdict::Wait => {
                    debug!(worker_id = probe.worker_id, reason = %reason, "watchdog: wait");
                }
                Verdict::NeedAi => {
                    // Without the AI layer this is operational logging only.
                    debug!(worker_id = probe.worker_id, reason = %reason, "watchdog: needs attention");
                }
            }
        }
    }

    /// Rule-based diagnosis. Order: liveness, error tokens, slow-tool
    /// aging, whole-worker inactivity.
    fn rule_diagnose(&self, probe: &WorkerProbe, log_tail: Option<&str>) -> (Verdict, String) {
        if !process_alive(probe.pid) {
            return (Verdict::Restart, format!("process {} is gone", probe.pid));
        }

        if let Some(tail) = log_tail {
            if let Some(token) = scan_error_tokens(tail) {
                return (
                    Verdict::Restart,
                    format!("error token {token:?} in log tail"),
                );
            }
        }

        let now_ms = Utc::now().timestamp_millis();

        if let Some(ref tool) = probe.slow_tool {
            let timeout_ms = self.category_timeout_ms(&tool.category);
            if let Some(timeout_ms) = timeout_ms {
                let age_ms = now_ms.saturating_sub(tool.started_at_ms);
                if age_ms > timeout_ms as i64 {
                    return (
                        Verdict::Restart,
                        format!(
                            "tool {} ({}) outstanding for {}s",
                            tool.name,
                            tool.category,
                            age_ms / 1000
                        ),
                    );
                }
            }
            // An in-budget slow tool defers the idle judgement.
            return (Verdict::Wait, format!("slow tool {} in progress", tool.name));
        }

        let idle_ms = now_ms.saturating_sub(probe.last_activity_ms);
        if idle_ms > self.config.activity_timeout_ms as i64 {
            return (
                Verdict::NeedAi,
                format!("no activity for {}s", idle_ms / 1000),
            );
        }

        (Verdict::Wait, "healthy".to_string())
    }

    fn category_timeout_ms(&self, category: &str) -> Option<u64> {
        let t = &self.config.slow_tool_timeouts;
        match category {
            "codex" => t.codex_ms,
            "gemini" => t.gemini_ms,
            "npmInstall" => t.npm_install_ms,
            "npmBuild" => t.npm_build_ms,
            _ => t.default_ms,
        }
    }

    /// Append one decision to the JSONL operation log; failures are
    /// logged and swallowed.
    fn append_op(&self, probe: &WorkerProbe, verdict: Verdict, reason: &str, source: &str) {
        let record = OpRecord {
            ts: Utc::now().to_rfc3339(),
            worker_id: probe.worker_id,
            pid: probe.pid,
            task_id: probe.task_id.clone(),
            verdict,
            reason: reason.to_string(),
            source: source.to_string(),
        };
        if let Err(e) = self.write_op(&record) {
            warn!(error = %e, "failed to append watchdog op record");
        }
    }

    fn write_op(&self, record: &OpRecord) -> std::io::Result<()> {
        use std::io::Write;
        if let Some(parent) = self.oplog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.oplog_path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        writeln!(file, "{line}")
    }
}

/// Probe a pid without signaling it.
fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence/permission check.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Scan a log tail for clear error tokens.
pub fn scan_error_tokens(tail: &str) -> Option<&'static str> {
    let lower = tail.to_lowercase();
    ERROR_TOKENS.iter().find(|t| lower.contains(*t)).copied()
}
