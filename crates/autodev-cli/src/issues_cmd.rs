//! `autodev issues`: list tracked issues for a plan, optionally dumping
//! a Markdown report.

use std::path::Path;

use anyhow::{Context, Result};

use autodev_core::config::SchedulerConfig;
use autodev_core::issue::IssueTracker;
use autodev_core::session::SessionStore;

pub fn run_issues(
    plan_path: &Path,
    config: &SchedulerConfig,
    report: Option<&Path>,
) -> Result<()> {
    let plan_path = std::path::absolute(plan_path)
        .with_context(|| format!("cannot resolve plan path {}", plan_path.display()))?;
    let store = SessionStore::new(&config.user_data_dir());

    let Some(snapshot) = store.load(&plan_path) else {
        println!("No session found for {}.", plan_path.display());
        return Ok(());
    };

    if snapshot.issues.is_empty() {
        println!("No issues recorded.");
        return Ok(());
    }

    let mut tracker = IssueTracker::new();
    tracker.hydrate(snapshot.issues);

    for issue in tracker.get_all() {
        println!(
            "[{}] [{}] {} (x{}) id={}",
            issue.severity, issue.status, issue.title, issue.occurrences, issue.id
        );
        if !issue.files.is_empty() {
            println!("    files: {}", issue.files.join(", "));
        }
        if let Some(ref reporter) = issue.reporter_task_id {
            println!("    reported by: {reporter}");
        }
    }

    if let Some(report_path) = report {
        tracker
            .write_to_file(report_path)
            .with_context(|| format!("failed to write report to {}", report_path.display()))?;
        println!("\nReport written to {}.", report_path.display());
    }
    Ok(())
}
