//! End-to-end scheduler flows with fake agent subprocesses: linear
//! dependency order, wave gating, and checkbox writeback.

use std::path::Path;
use std::time::Duration;

use autodev_core::config::SchedulerConfig;
use autodev_core::events::Notice;
use autodev_core::task::TaskStatus;
use autodev_core::Scheduler;

use autodev_test_utils::{success_agent, write_plan, write_script};

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

const LINEAR_PLAN: &str = "\
# Plan

## Wave 1

### A-1: first
- [ ] do a

### B-1: second
- [ ] do b
**依赖**: A-1

## Wave 2

### C-1: third
- [ ] do c
**依赖**: B-1
";

#[tokio::test]
async fn linear_graph_runs_in_dependency_order() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = success_agent(tmp.path(), "agent.sh");
    let plan = write_plan(tmp.path(), LINEAR_PLAN);

    let scheduler = Scheduler::new(test_config(tmp.path(), &agent));
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    // Collect the order in which tasks entered `running`.
    let mut running_order = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TaskUpdate { task } = notice {
            if task.status == TaskStatus::Running {
                running_order.push(task.id.clone());
            }
        }
    }
    assert_eq!(running_order, vec!["A-1", "B-1", "C-1"]);

    let snapshot = scheduler.snapshot().await.unwrap();
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Success));
    assert!(!snapshot.running);
    assert!(snapshot.active_workers.is_empty());

    // The plan file carries three checked boxes after writeback drains.
    let text = std::fs::read_to_string(&plan).unwrap();
    assert_eq!(text.matches("- [x]").count(), 3);
    assert_eq!(text.matches("- [ ]").count(), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn wave_gate_holds_back_later_waves() {
    let tmp = tempfile::tempdir().unwrap();
    // Slow enough that a wave-gate violation would overlap the runs.
    let agent = write_script(
        tmp.path(),
        "agent.sh",
        "#!/bin/sh\nread _prompt\nsleep 0.3\n\
         echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":300}'\n",
    );
    // X-1 has no dependencies at all; only the wave gate keeps it back.
    let plan = write_plan(
        tmp.path(),
        "\
## Wave 1

### A-1: first
- [ ] a

## Wave 2

### X-1: independent
- [ ] x
",
    );

    let scheduler = Scheduler::new(test_config(tmp.path(), &agent));
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    let mut sequence = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TaskUpdate { task } = notice {
            sequence.push((task.id.clone(), task.status));
        }
    }
    let a_success = sequence
        .iter()
        .position(|(id, s)| id == "A-1" && *s == TaskStatus::Success)
        .expect("A-1 must succeed");
    let x_running = sequence
        .iter()
        .position(|(id, s)| id == "X-1" && *s == TaskStatus::Running)
        .expect("X-1 must run");
    assert!(
        x_running > a_success,
        "wave 2 must not dispatch before wave 1 is terminal"
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn max_parallel_bounds_concurrency() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = write_script(
        tmp.path(),
        "agent.sh",
        "#!/bin/sh\nread _prompt\nsleep 0.2\n\
         echo '{\"type\":\"result\",\"subtype\":\"success\",\"duration_ms\":200}'\n",
    );
    // Four independent tasks in one wave, two slots.
    let plan = write_plan(
        tmp.path(),
        "\
## Wave 1

### A-1: a
- [ ] a

### B-1: b
- [ ] b

### C-1: c
- [ ] c

### D-1: d
- [ ] d
",
    );

    let mut config = test_config(tmp.path(), &agent);
    config.max_parallel = 2;
    let scheduler = Scheduler::new(config);
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    // Replay task updates, tracking concurrent `running` tasks.
    let mut running = std::collections::HashSet::new();
    let mut max_concurrent = 0usize;
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TaskUpdate { task } = notice {
            match task.status {
                TaskStatus::Running => {
                    running.insert(task.id.clone());
                }
                _ => {
                    running.remove(&task.id);
                }
            }
            max_concurrent = max_concurrent.max(running.len());
        }
    }
    assert!(max_concurrent >= 2, "two slots should actually be used");
    assert!(max_concurrent <= 2, "never more than max_parallel workers");

    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.progress.success, 4);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn file_loaded_precedes_task_updates() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = success_agent(tmp.path(), "agent.sh");
    let plan = write_plan(tmp.path(), LINEAR_PLAN);

    let scheduler = Scheduler::new(test_config(tmp.path(), &agent));
    let mut notices = scheduler.subscribe();
    scheduler.load_file(&plan).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        Notice::FileLoaded { task_count, .. } => assert_eq!(task_count, 3),
        other => panic!("expected fileLoaded first, got {other:?}"),
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn tasks_already_checked_in_file_are_not_rerun() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = success_agent(tmp.path(), "agent.sh");
    let plan = write_plan(
        tmp.path(),
        "\
## Wave 1

### A-1: done already
- [x] a

### B-1: todo
- [ ] b
**依赖**: A-1
",
    );

    let scheduler = Scheduler::new(test_config(tmp.path(), &agent));
    let mut notices = scheduler.subscribe();

    scheduler.load_file(&plan).await.unwrap();
    run_to_completion(&scheduler).await;

    let mut a_ran = false;
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TaskUpdate { task } = notice {
            if task.id == "A-1" && task.status == TaskStatus::Running {
                a_ran = true;
            }
        }
    }
    assert!(!a_ran, "a checked-off task must not be dispatched again");

    let snapshot = scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.progress.success, 2);

    scheduler.shutdown().await;
}
