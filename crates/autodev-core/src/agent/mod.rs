//! Child agent process management.
//!
//! Launches the agent CLI with line-delimited JSON stdio and owns
//! process-group termination. The stream protocol itself is decoded by
//! [`frames`].

pub mod frames;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

pub use frames::{AgentFrame, parse_line};

/// A spawned agent child with piped stdio.
#[derive(Debug)]
pub struct AgentProcess {
    pub pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    killed: bool,
}

/// Launch the agent binary with JSONL stdio.
///
/// On Unix the child is placed in its own process group (`setsid`) so a
/// later [`AgentProcess::kill_tree`] reaches every descendant -- agent
/// CLIs routinely fork helpers of their own.
pub fn launch(
    binary: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<AgentProcess> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    for (key, value) in env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // New session => new process group led by the child.
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().with_context(|| {
        format!("failed to spawn agent binary '{binary}' -- is it installed and on PATH?")
    })?;

    let pid = child.id().context("agent child has no pid")?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    debug!(pid, binary, "agent process launched");
    Ok(AgentProcess {
        pid,
        child,
        stdin,
        stdout,
        stderr,
        killed: false,
    })
}

impl AgentProcess {
    /// Send one user message frame (`{"type":"user",...}`) on stdin.
    pub async fn send_user_message(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .context("agent stdin already closed")?;
        let frame = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        });
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write user message to agent stdin")?;
        stdin.flush().await.context("failed to flush agent stdin")?;
        Ok(())
    }

    /// Terminate the whole process tree. Idempotent: repeated calls are
    /// no-ops once the group is gone.
    ///
    /// Sends SIGTERM to the process group, waits briefly, then SIGKILLs
    /// the group if the direct child has not exited.
    pub async fn kill_tree(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        // Closing stdin first lets well-behaved CLIs wind down.
        self.stdin.take();

        #[cfg(unix)]
        {
            let pgid = self.pid as i32;
            // SAFETY: pid came from a child we spawned into its own group.
            let ret = unsafe { libc::killpg(pgid, libc::SIGTERM) };
            if ret != 0 {
                debug!(pid = self.pid, "SIGTERM to process group failed (already gone?)");
            }

            let exited =
                tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid = self.pid, "agent exited after SIGTERM");
                }
                _ => {
                    debug!(pid = self.pid, "agent survived SIGTERM, sending SIGKILL");
                    // SAFETY: same group as above.
                    unsafe { libc::killpg(pgid, libc::SIGKILL) };
                    let _ = self.child.wait().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.kill().await {
                tracing::warn!(pid = self.pid, error = %e, "failed to kill agent child");
            }
        }
    }

    /// Whether the direct child is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn launch_pipes_stdio_and_reports_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "agent.sh",
            "#!/bin/sh\necho '{\"type\":\"result\",\"subtype\":\"success\"}'\n",
        );
        let mut proc = launch(
            script.to_str().unwrap(),
            &[],
            tmp.path(),
            &HashMap::new(),
        )
        .unwrap();
        assert!(proc.pid > 0);
        assert!(proc.stdout.is_some());

        use tokio::io::{AsyncBufReadExt, BufReader};
        let stdout = proc.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let frames = parse_line(&line).unwrap();
        assert!(matches!(frames[0], AgentFrame::Result { success: true, .. }));
    }

    #[tokio::test]
    async fn launch_missing_binary_errors() {
        let err = launch(
            "/nonexistent/agent-binary",
            &[],
            Path::new("/tmp"),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn agent binary"));
    }

    #[tokio::test]
    async fn send_user_message_reaches_child_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // Echo the first stdin line back as a result frame.
        let script = write_script(
            tmp.path(),
            "agent.sh",
            "#!/bin/sh\nread line\necho \"$line\"\n",
        );
        let mut proc = launch(
            script.to_str().unwrap(),
            &[],
            tmp.path(),
            &HashMap::new(),
        )
        .unwrap();
        proc.send_user_message("start BE-1").await.unwrap();

        use tokio::io::{AsyncBufReadExt, BufReader};
        let stdout = proc.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "user");
        assert_eq!(v["message"]["content"], "start BE-1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_tree_terminates_descendants() {
        let tmp = tempfile::tempdir().unwrap();
        // The script forks a sleeper child; killing only the direct pid
        // would leave it behind.
        let script = write_script(
            tmp.path(),
            "agent.sh",
            "#!/bin/sh\nsleep 600 &\necho \"child:$!\"\nwait\n",
        );
        let mut proc = launch(
            script.to_str().unwrap(),
            &[],
            tmp.path(),
            &HashMap::new(),
        )
        .unwrap();

        use tokio::io::{AsyncBufReadExt, BufReader};
        let stdout = proc.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let sleeper_pid: i32 = line.trim_start_matches("child:").trim().parse().unwrap();

        proc.kill_tree().await;
        // Give the group kill a moment to land.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // kill(pid, 0) == -1 with ESRCH once the sleeper is gone.
        let alive = unsafe { libc::kill(sleeper_pid, 0) } == 0;
        assert!(!alive, "descendant sleeper should be dead after kill_tree");
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn kill_tree_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "agent.sh", "#!/bin/sh\nsleep 600\n");
        let mut proc = launch(
            script.to_str().unwrap(),
            &[],
            tmp.path(),
            &HashMap::new(),
        )
        .unwrap();
        proc.kill_tree().await;
        proc.kill_tree().await;
        assert!(!proc.is_running());
    }
}
