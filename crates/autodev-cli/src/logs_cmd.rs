//! `autodev logs`: print the most recent archived log for a task.

use anyhow::Result;

use autodev_core::config::SchedulerConfig;
use autodev_core::logs::LogArchiver;

pub async fn run_logs(task_id: &str, config: &SchedulerConfig, tail: Option<usize>) -> Result<()> {
    let archiver = LogArchiver::new(&config.user_data_dir());
    let task_id = autodev_core::task::canonical_task_id(task_id);

    let Some(path) = archiver.latest_log_file(&task_id).await else {
        println!("No logs found for task {task_id}.");
        return Ok(());
    };

    let text = tokio::fs::read_to_string(&path).await?;
    println!("# {}", path.display());
    match tail {
        Some(n) => {
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            for line in &lines[start..] {
                println!("{line}");
            }
        }
        None => print!("{text}"),
    }
    Ok(())
}
