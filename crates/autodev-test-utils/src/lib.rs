//! Shared test helpers: fake agent scripts and plan-file builders.
//!
//! The scheduler's integration tests drive the real worker supervisor
//! against small shell scripts that impersonate the agent CLI: they read
//! the startup prompt from stdin and emit a scripted JSONL stream on
//! stdout.

use std::path::{Path, PathBuf};

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write fake agent script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake agent script");
    }
    path
}

/// A fake agent that emits the given JSONL lines and exits successfully.
/// The script consumes the startup prompt line first, as the real CLI
/// does.
pub fn scripted_agent(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let mut body = String::from("#!/bin/sh\nread _prompt\n");
    for line in lines {
        body.push_str(&format!("echo '{}'\n", line.replace('\'', r"'\''")));
    }
    write_script(dir, name, &body)
}

/// A fake agent that always succeeds after echoing one assistant line.
pub fn success_agent(dir: &Path, name: &str) -> PathBuf {
    scripted_agent(
        dir,
        name,
        &[
            r#"{"type":"system","subtype":"init","session_id":"fake"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working"}],"usage":{"input_tokens":100,"output_tokens":20}}}"#,
            r#"{"type":"result","subtype":"success","duration_ms":5}"#,
        ],
    )
}

/// A fake agent that always fails with the given result subtype.
pub fn failing_agent(dir: &Path, name: &str, subtype: &str) -> PathBuf {
    scripted_agent(
        dir,
        name,
        &[&format!(
            r#"{{"type":"result","subtype":"{subtype}","duration_ms":5}}"#
        )],
    )
}

/// A fake agent that fails on its first invocation and succeeds on every
/// later one, keyed by a marker file in `state_dir`.
pub fn fail_once_agent(dir: &Path, name: &str, state_dir: &Path) -> PathBuf {
    let marker = state_dir.join(format!("{name}.ran"));
    let body = format!(
        "#!/bin/sh\nread _prompt\n\
         if [ -f '{marker}' ]; then\n\
           echo '{{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}}'\n\
         else\n\
           touch '{marker}'\n\
           echo '{{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"duration_ms\":5}}'\n\
         fi\n",
        marker = marker.display(),
    );
    write_script(dir, name, &body)
}

/// A fake agent that fails the first run of one specific task (matched
/// against the startup prompt) and succeeds everywhere else.
pub fn fail_task_once_agent(
    dir: &Path,
    name: &str,
    task_id: &str,
    state_dir: &Path,
) -> PathBuf {
    let marker = state_dir.join(format!("{name}.{task_id}.ran"));
    let body = format!(
        "#!/bin/sh\nread _prompt\n\
         case \"$_prompt\" in *{task_id}*)\n\
           if [ -f '{marker}' ]; then\n\
             echo '{{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}}'\n\
           else\n\
             touch '{marker}'\n\
             echo '{{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"duration_ms\":5}}'\n\
           fi\n\
           exit 0;;\n\
         esac\n\
         echo '{{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}}'\n",
        marker = marker.display(),
    );
    write_script(dir, name, &body)
}

/// A fake agent that succeeds only for the task ids listed in
/// `fail_ids`' complement: ids contained in the startup prompt matching
/// any entry of `fail_ids` fail, everything else succeeds.
pub fn fail_for_tasks_agent(dir: &Path, name: &str, fail_ids: &[&str]) -> PathBuf {
    let mut body = String::from("#!/bin/sh\nread _prompt\n");
    for id in fail_ids {
        body.push_str(&format!(
            "case \"$_prompt\" in *{id}*)\n\
             echo '{{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"duration_ms\":5}}'\n\
             exit 0;;\nesac\n",
        ));
    }
    body.push_str("echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}'\n");
    write_script(dir, name, &body)
}

/// A fake agent that emits an issue line before succeeding.
pub fn issue_agent(dir: &Path, name: &str, issue_json: &str) -> PathBuf {
    let mut body = String::from("#!/bin/sh\nread _prompt\n");
    body.push_str(&format!(
        "echo 'AUTO_DEV_ISSUE: {}'\n",
        issue_json.replace('\'', r"'\''")
    ));
    body.push_str("echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}'\n");
    write_script(dir, name, &body)
}

/// A fake agent that sleeps forever (until killed).
pub fn hanging_agent(dir: &Path, name: &str) -> PathBuf {
    write_script(dir, name, "#!/bin/sh\nread _prompt\nsleep 600\n")
}

/// Write a plan file with the given content and return its path.
pub fn write_plan(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("AUTO-DEV.md");
    std::fs::write(&path, content).expect("failed to write plan file");
    path
}
