//! Retry backoff and cascade helpers.
//!
//! Pure functions over the task map, called only from the scheduler's
//! single-writer loop.

use std::collections::{BTreeMap, HashSet, VecDeque};

use rand::Rng;

use crate::task::{Task, TaskStatus};

/// Exponential backoff for attempt `n` (1-based):
/// `min(max, base * 2^(n-1)) + jitter(0..base)`.
pub fn compute_backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(20);
    let capped = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..base_ms)
    };
    capped.saturating_add(jitter)
}

/// True when every dependency of `task` is `success`.
pub fn deps_satisfied(tasks: &BTreeMap<String, Task>, task: &Task) -> bool {
    task.dependencies.iter().all(|dep| {
        tasks
            .get(dep)
            .map(|d| d.status == TaskStatus::Success)
            .unwrap_or(false)
    })
}

/// Ids of every task that transitively depends on `root`, in BFS order.
pub fn dependents_closure(tasks: &BTreeMap<String, Task>, root: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(root);
    seen.insert(root);

    while let Some(current) = queue.pop_front() {
        for task in tasks.values() {
            if task.dependencies.iter().any(|d| d == current) && seen.insert(task.id.as_str()) {
                out.push(task.id.clone());
                queue.push_back(task.id.as_str());
            }
        }
    }
    out
}

/// Force every non-terminal transitive dependent of `failed_id` to
/// `failed` (with no retry scheduled). Returns the ids that changed.
pub fn cascade_failure(tasks: &mut BTreeMap<String, Task>, failed_id: &str) -> Vec<String> {
    let mut changed = Vec::new();
    for id in dependents_closure(tasks, failed_id) {
        let Some(task) = tasks.get_mut(&id) else {
            continue;
        };
        if task.is_terminal() {
            continue;
        }
        task.status = TaskStatus::Failed;
        task.next_retry_at = None;
        changed.push(id);
    }
    changed
}

/// After a manual retry of `root`, re-open every transitively dependent
/// task that is `failed`: it becomes `ready` or `pending` depending on
/// dependency satisfaction, with its retry bookkeeping cleared. Returns
/// the ids that changed.
pub fn cascade_reset(tasks: &mut BTreeMap<String, Task>, root: &str) -> Vec<String> {
    let mut changed = Vec::new();
    for id in dependents_closure(tasks, root) {
        let satisfied = {
            let Some(task) = tasks.get(&id) else { continue };
            if task.status != TaskStatus::Failed {
                continue;
            }
            deps_satisfied(tasks, task)
        };
        let task = tasks.get_mut(&id).expect("id came from the closure");
        task.status = if satisfied {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        task.clear_retry_state();
        changed.push(id);
    }
    changed
}
