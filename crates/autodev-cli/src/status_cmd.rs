//! `autodev status`: summarize the persisted session for a plan file.

use std::path::Path;

use anyhow::{Context, Result};

use autodev_core::config::SchedulerConfig;
use autodev_core::session::SessionStore;

pub fn run_status(plan_path: &Path, config: &SchedulerConfig) -> Result<()> {
    let plan_path = std::path::absolute(plan_path)
        .with_context(|| format!("cannot resolve plan path {}", plan_path.display()))?;
    let store = SessionStore::new(&config.user_data_dir());

    let Some(snapshot) = store.load(&plan_path) else {
        println!("No session found for {}.", plan_path.display());
        return Ok(());
    };

    println!("Session for {}", snapshot.plan_path.display());
    println!("  saved: {}", snapshot.saved_at.to_rfc3339());
    if snapshot.paused {
        match snapshot.pause_reason {
            Some(reason) => println!("  paused ({reason:?})"),
            None => println!("  paused"),
        }
    }

    let mut by_status: std::collections::BTreeMap<String, usize> = Default::default();
    for state in snapshot.tasks.values() {
        *by_status.entry(state.status.to_string()).or_default() += 1;
    }
    let counts: Vec<String> = by_status
        .iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect();
    println!("  tasks: {} ({})", snapshot.tasks.len(), counts.join(", "));

    for (id, state) in &snapshot.tasks {
        let duration = state
            .duration_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string());
        let retries = if state.retry_count > 0 {
            format!(" retries={}", state.retry_count)
        } else {
            String::new()
        };
        println!("    {:<16} {:<8} {}{}", id, state.status.to_string(), duration, retries);
    }

    let open = snapshot
        .issues
        .iter()
        .filter(|i| i.status == autodev_core::issue::IssueStatus::Open)
        .count();
    if !snapshot.issues.is_empty() {
        println!("  issues: {} total, {} open", snapshot.issues.len(), open);
    }
    Ok(())
}
