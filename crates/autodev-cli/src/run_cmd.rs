//! `autodev run`: load a plan, hydrate the session, and drive the
//! scheduler to completion, streaming events to the terminal.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use autodev_core::config::SchedulerConfig;
use autodev_core::events::Notice;
use autodev_core::task::TaskStatus;
use autodev_core::Scheduler;

/// Run a plan to completion. Returns `true` when every task succeeded.
pub async fn run_plan(plan_path: &Path, config: SchedulerConfig, quiet: bool) -> Result<bool> {
    let plan_path = std::path::absolute(plan_path)
        .with_context(|| format!("cannot resolve plan path {}", plan_path.display()))?;

    let scheduler = Scheduler::with_wave_hook(
        config,
        Some(Arc::new(|wave| {
            println!("── wave {wave} complete ──");
        })),
    );
    let mut notices = scheduler.subscribe();

    let summary = scheduler.load_file(&plan_path).await?;
    println!(
        "Loaded {} tasks across {} waves from {}",
        summary.task_count,
        summary.waves.len(),
        summary.path.display()
    );
    if summary.task_count == 0 {
        println!("Nothing to do.");
        scheduler.shutdown().await;
        return Ok(true);
    }

    scheduler.start().await?;

    // Print events until the run terminates.
    let printer = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            print_notice(&notice, quiet);
        }
    });

    scheduler.wait_until_stopped().await;
    // Give trailing notices a moment to drain, then stop printing.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    printer.abort();

    let snapshot = scheduler.snapshot().await?;
    let all_success = snapshot
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Success);

    println!();
    println!(
        "Run finished: {} succeeded, {} failed, {} total.",
        snapshot.progress.success, snapshot.progress.failed, snapshot.progress.total
    );
    if !snapshot.issues.is_empty() {
        println!("Issues recorded: {}", snapshot.issues.len());
        for issue in snapshot.issues.iter().filter(|i| {
            i.status == autodev_core::issue::IssueStatus::Open
        }) {
            println!("  [{}] {} (x{})", issue.severity, issue.title, issue.occurrences);
        }
    }

    scheduler.shutdown().await;
    Ok(all_success)
}

fn print_notice(notice: &Notice, quiet: bool) {
    match notice {
        Notice::TaskUpdate { task } => {
            println!("task {} -> {}", task.id, task.status);
        }
        Notice::WorkerLog {
            worker_id, entry, ..
        } => {
            if !quiet {
                println!("  [w{}] [{}] {}", worker_id, entry.kind.as_str(), entry.content);
            }
        }
        Notice::SchedulerState {
            running,
            paused,
            detail,
            ..
        } => {
            let state = match (running, paused) {
                (true, true) => "paused",
                (true, false) => "running",
                (false, _) => "stopped",
            };
            match detail {
                Some(detail) => println!("scheduler {state}: {detail}"),
                None => println!("scheduler {state}"),
            }
        }
        Notice::BlockerAutoPause {
            issue,
            open_blockers,
        } => {
            println!(
                "BLOCKER: {} ({} open) -- scheduler paused; resolve and resume",
                issue.title, open_blockers
            );
        }
        Notice::ApiError {
            message,
            attempt,
            next_retry_in_ms,
        } => match next_retry_in_ms {
            Some(ms) => println!(
                "API error (attempt {attempt}): {message}; retrying in {}s",
                ms / 1000
            ),
            None => println!("API error: {message}; retry budget exhausted, awaiting user"),
        },
        Notice::IssueReported { issue } => {
            println!("issue [{}] {} (x{})", issue.severity, issue.title, issue.occurrences);
        }
        Notice::Progress { .. }
        | Notice::WorkerState { .. }
        | Notice::FileLoaded { .. }
        | Notice::IssueUpdate { .. } => {}
    }
}
