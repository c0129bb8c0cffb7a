//! AI-assisted watchdog diagnosis.
//!
//! When the rule layer cannot decide (`need_ai`), an isolated agent
//! process is given a structured prompt and must answer with a single
//! JSON object `{"action": "restart|wait|need_ai", "reason": "..."}`.
//! The call is time-limited; any parse failure degrades back to
//! `need_ai` rather than guessing.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::worker::issue_scan::extract_balanced_json;

use super::{Verdict, WorkerProbe};

/// Parsed AI decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiDecision {
    pub action: Verdict,
    pub reason: String,
}

/// Build the diagnosis prompt from the worker probe and log tail.
pub fn build_prompt(probe: &WorkerProbe, log_tail: Option<&str>) -> String {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let idle_secs = now_ms.saturating_sub(probe.last_activity_ms) / 1000;
    let tool = match &probe.slow_tool {
        Some(t) => format!(
            "{} ({}), running for {}s",
            t.name,
            t.category,
            now_ms.saturating_sub(t.started_at_ms) / 1000
        ),
        None => "none".to_string(),
    };
    format!(
        "You are diagnosing a possibly stuck coding-agent worker.\n\
         worker_id: {id}\n\
         pid: {pid}\n\
         task: {task}\n\
         idle_for_seconds: {idle_secs}\n\
         outstanding_tool: {tool}\n\n\
         Recent log tail:\n\
         ---\n{tail}\n---\n\n\
         Decide whether the worker should be restarted. Respond with ONLY \
         one JSON object, no prose:\n\
         {{\"action\": \"restart|wait|need_ai\", \"reason\": \"...\"}}",
        id = probe.worker_id,
        pid = probe.pid,
        task = probe.task_id,
        tail = log_tail.unwrap_or("(no log tail available)"),
    )
}

/// Run one diagnosis call against the agent binary. The prompt is passed
/// via `-p`; stdout is scanned for the first balanced JSON object.
pub async fn diagnose(binary: &str, prompt: &str, timeout: Duration) -> Result<AiDecision> {
    let mut child = Command::new(binary)
        .arg("-p")
        .arg(prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn diagnosis agent '{binary}'"))?;

    let mut stdout = child.stdout.take().context("diagnosis agent has no stdout")?;

    let read_all = async {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf).await?;
        let _ = child.wait().await;
        Ok::<String, std::io::Error>(buf)
    };

    let output = match tokio::time::timeout(timeout, read_all).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => bail!("failed to read diagnosis output: {e}"),
        Err(_) => {
            let _ = child.kill().await;
            bail!("diagnosis timed out after {}s", timeout.as_secs());
        }
    };

    parse_decision(&output)
}

/// Parse a decision out of free-form agent output.
pub fn parse_decision(output: &str) -> Result<AiDecision> {
    let json_text =
        extract_balanced_json(output).context("no JSON object in diagnosis output")?;
    let v: serde_json::Value =
        serde_json::from_str(json_text).context("diagnosis output is not valid JSON")?;

    let action = v
        .get("action")
        .and_then(serde_json::Value::as_str)
        .context("diagnosis output lacks an action")?
        .parse::<Verdict>()
        .map_err(|()| anyhow::anyhow!("unrecognized diagnosis action"))?;

    let reason = v
        .get("reason")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("(no reason given)")
        .to_string();

    Ok(AiDecision { action, reason })
}
