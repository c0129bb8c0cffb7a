//! API-error recovery: pause, backoff, automatic resume, redispatch.

use std::path::Path;
use std::time::Duration;

use autodev_core::config::SchedulerConfig;
use autodev_core::events::{Notice, PauseReason};
use autodev_core::task::TaskStatus;
use autodev_core::Scheduler;

use autodev_test_utils::{write_plan, write_script};

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
    config.api_error.base_delay_ms = 200;
    config.api_error.max_delay_ms = 1_000;
    config.auto_retry.enabled = false;
    config
}

/// First invocation hits an API error; later ones succeed.
fn api_error_once_agent(tmp: &Path) -> std::path::PathBuf {
    let marker = tmp.join("api-error.ran");
    write_script(
        tmp,
        "agent.sh",
        &format!(
            "#!/bin/sh\nread _prompt\n\
             if [ -f '{marker}' ]; then\n\
               echo '{{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":5}}'\n\
             else\n\
               touch '{marker}'\n\
               echo '{{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"upstream rate_limit_error, giving up\"}}]}}}}'\n\
               sleep 600\n\
             fi\n",
            marker = marker.display(),
        ),
    )
}

#[tokio::test]
async fn api_error_pauses_backs_off_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = api_error_once_agent(tmp.path());
    let plan = write_plan(tmp.path(), "### A-1: flaky upstream\n- [ ] a\n");

    let scheduler = Scheduler::new(test_config(tmp.path(), &agent));
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    scheduler.start().await.unwrap();

    // The apiError notice carries the scheduled backoff.
    let api_notice = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Notice::ApiError {
                attempt,
                next_retry_in_ms,
                ..
            } = notices.recv().await.unwrap()
            {
                return (attempt, next_retry_in_ms);
            }
        }
    })
    .await
    .expect("apiError notice should fire");
    assert_eq!(api_notice.0, 1);
    assert!(api_notice.1.is_some(), "a resume should be scheduled");

    // While paused for the API error, the task sits ready again.
    let snapshot = scheduler.snapshot().await.unwrap();
    if snapshot.paused {
        assert_eq!(snapshot.pause_reason, Some(PauseReason::ApiError));
    }

    // After the backoff the scheduler resumes on its own and the rerun
    // succeeds.
    tokio::time::timeout(Duration::from_secs(30), scheduler.wait_until_stopped())
        .await
        .expect("run should finish after automatic resume");

    let snapshot = scheduler.snapshot().await.unwrap();
    let a = snapshot.tasks.iter().find(|t| t.id == "A-1").unwrap();
    assert_eq!(a.status, TaskStatus::Success);
    assert!(!a.is_api_error_recovery, "recovery flag clears on success");
    assert!(!snapshot.paused);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn exhausted_api_error_budget_leaves_scheduler_paused() {
    let tmp = tempfile::tempdir().unwrap();
    // Every invocation reports an API error and hangs.
    let agent = write_script(
        tmp.path(),
        "agent.sh",
        "#!/bin/sh\nread _prompt\n\
         echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"overloaded_error again\"}]}}'\n\
         sleep 600\n",
    );
    let plan = write_plan(tmp.path(), "### A-1: hopeless upstream\n- [ ] a\n");

    let mut config = test_config(tmp.path(), &agent);
    config.api_error.max_retries = 2;
    config.api_error.max_task_retries = 10;

    let scheduler = Scheduler::new(config);
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    scheduler.start().await.unwrap();

    // Wait for the exhaustion notice (next_retry_in_ms == None).
    let exhausted = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Notice::ApiError {
                next_retry_in_ms, ..
            } = notices.recv().await.unwrap()
            {
                if next_retry_in_ms.is_none() {
                    return true;
                }
            }
        }
    })
    .await
    .expect("exhaustion notice should fire");
    assert!(exhausted);

    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(snapshot.paused, "scheduler stays paused awaiting the user");
    assert_eq!(snapshot.pause_reason, Some(PauseReason::ApiError));

    scheduler.shutdown().await;
}
