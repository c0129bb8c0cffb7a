//! Auto-retry and cascading-failure behavior.

use std::path::Path;
use std::time::Duration;

use autodev_core::config::SchedulerConfig;
use autodev_core::events::Notice;
use autodev_core::task::TaskStatus;
use autodev_core::Scheduler;

use autodev_test_utils::{fail_for_tasks_agent, fail_task_once_agent, write_plan};

fn test_config(tmp: &Path, agent: &Path) -> SchedulerConfig {
    let mut config = SchedulerConfig {
        max_parallel: 2,
        tick_interval_ms: 50,
        agent_binary: agent.to_string_lossy().into_owned(),
        user_data_dir: Some(tmp.join("userdata")),
        project_root: Some(tmp.to_path_buf()),
        ..Default::default()
    };
    config.watchdog.worker_tick_ms = 50;
    config
}

async fn run_to_completion(scheduler: &Scheduler) {
    scheduler.start().await.expect("start");
    tokio::time::timeout(Duration::from_secs(30), scheduler.wait_until_stopped())
        .await
        .expect("run should terminate");
}

const FAN_OUT_PLAN: &str = "\
## Wave 1

### A-1: root
- [ ] a

## Wave 2

### B-1: left
- [ ] b
**依赖**: A-1

### C-1: middle
- [ ] c
**依赖**: A-1

### D-1: right
- [ ] d
**依赖**: A-1
";

#[tokio::test]
async fn failed_task_is_retried_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    // C-1 fails its first run, succeeds on retry; everything else passes.
    let agent = fail_task_once_agent(tmp.path(), "agent.sh", "C-1", tmp.path());
    let plan = write_plan(tmp.path(), FAN_OUT_PLAN);

    let mut config = test_config(tmp.path(), &agent);
    config.auto_retry.enabled = true;
    config.auto_retry.max_retries = 1;
    config.auto_retry.base_delay_ms = 1_000;

    let scheduler = Scheduler::new(config);
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    // A retry was scheduled at some point: C-1 failed with a retry time.
    let mut saw_scheduled_retry = false;
    let mut b_or_d_failed = false;
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TaskUpdate { task } = notice {
            if task.id == "C-1" && task.status == TaskStatus::Failed {
                saw_scheduled_retry |= task.next_retry_at.is_some();
            }
            if (task.id == "B-1" || task.id == "D-1") && task.status == TaskStatus::Failed {
                b_or_d_failed = true;
            }
        }
    }
    assert!(saw_scheduled_retry, "C-1 should have had a retry scheduled");
    assert!(!b_or_d_failed, "a scheduled retry must not cascade");

    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(
        snapshot.tasks.iter().all(|t| t.status == TaskStatus::Success),
        "all tasks succeed after the retry: {:?}",
        snapshot
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect::<Vec<_>>()
    );
    let c = snapshot.tasks.iter().find(|t| t.id == "C-1").unwrap();
    assert_eq!(c.retry_count, 0, "success clears the retry counter");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_cascade_to_dependents() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = fail_for_tasks_agent(tmp.path(), "agent.sh", &["C-1"]);
    let plan = write_plan(
        tmp.path(),
        &format!(
            "{FAN_OUT_PLAN}\n## Wave 3\n\n### E-1: downstream\n- [ ] e\n**依赖**: C-1\n"
        ),
    );

    let mut config = test_config(tmp.path(), &agent);
    config.auto_retry.enabled = false;

    let scheduler = Scheduler::new(config);
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    let mut e_ran = false;
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TaskUpdate { task } = notice {
            if task.id == "E-1" && task.status == TaskStatus::Running {
                e_ran = true;
            }
        }
    }
    assert!(!e_ran, "E-1 must be failed by cascade without ever running");

    let snapshot = scheduler.snapshot().await.unwrap();
    let status_of = |id: &str| {
        snapshot
            .tasks
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.status)
            .unwrap()
    };
    assert_eq!(status_of("C-1"), TaskStatus::Failed);
    assert_eq!(status_of("E-1"), TaskStatus::Failed);
    assert_eq!(status_of("B-1"), TaskStatus::Success);
    assert_eq!(status_of("D-1"), TaskStatus::Success);
    assert_eq!(snapshot.progress.failed, 2);
    assert!(!snapshot.running, "run terminates once everything is terminal");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn manual_retry_resets_budget_and_reopens_dependents() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = fail_for_tasks_agent(tmp.path(), "agent.sh", &["C-1"]);
    let plan = write_plan(
        tmp.path(),
        "\
## Wave 1

### C-1: flaky
- [ ] c

## Wave 2

### E-1: downstream
- [ ] e
**依赖**: C-1
",
    );

    let mut config = test_config(tmp.path(), &agent);
    config.auto_retry.enabled = false;

    let scheduler = Scheduler::new(config);
    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.progress.failed, 2, "C-1 failed, E-1 cascaded");

    // Swap the agent body for one that succeeds, then manually retry.
    autodev_test_utils::write_script(
        tmp.path(),
        "agent.sh",
        "#!/bin/sh\nread _prompt\n\
         echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}'\n",
    );

    scheduler.retry_task("C-1").await.unwrap();
    run_to_completion(&scheduler).await;

    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(
        snapshot.tasks.iter().all(|t| t.status == TaskStatus::Success),
        "after manual retry everything recovers: {:?}",
        snapshot
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect::<Vec<_>>()
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn retrying_a_non_failed_task_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = fail_for_tasks_agent(tmp.path(), "agent.sh", &[]);
    let plan = write_plan(tmp.path(), "### A-1: fine\n- [ ] a\n");

    let scheduler = Scheduler::new(test_config(tmp.path(), &agent));
    scheduler.load_file(&plan).await.unwrap();

    let err = scheduler.retry_task("A-1").await.unwrap_err();
    assert!(err.to_string().contains("expected failed"));

    let err = scheduler.retry_task("GHOST-1").await.unwrap_err();
    assert!(err.to_string().contains("unknown task"));

    scheduler.shutdown().await;
}
