//! Plan graph diagnostics.
//!
//! The parser is permissive (bad constructs are skipped); this module
//! reports the structural problems an operator wants to know about before
//! a run: unknown dependency references and dependency cycles. Cycle
//! detection uses Kahn's algorithm (topological sort).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::task::Task;

/// A structural problem found in a parsed plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDiagnostic {
    /// A task lists a dependency id that no task in the plan declares.
    UnknownDependency { task: String, dependency: String },
    /// Tasks that participate in a dependency cycle.
    DependencyCycle(Vec<String>),
}

impl fmt::Display for PlanDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDependency { task, dependency } => {
                write!(f, "task {task} depends on unknown task {dependency}")
            }
            Self::DependencyCycle(members) => {
                write!(f, "dependency cycle involving: {}", members.join(", "))
            }
        }
    }
}

/// Validate the dependency structure of a parsed plan.
pub fn validate_plan(tasks: &[Task]) -> Vec<PlanDiagnostic> {
    let mut out = Vec::new();

    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

    for task in tasks {
        for dep in &task.dependencies {
            if !known.contains(dep.as_str()) {
                out.push(PlanDiagnostic::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(tasks) {
        out.push(PlanDiagnostic::DependencyCycle(cycle));
    }

    out
}

/// Detect dependency cycles with Kahn's algorithm. Returns the ids left
/// with nonzero in-degree (the cycle participants), or `None` for a DAG.
fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in tasks {
        let task_idx = index[task.id.as_str()];
        for dep in &task.dependencies {
            // Unknown deps are reported separately; skip them here.
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                continue;
            };
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted == n {
        return None;
    }
    Some(
        in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| ids[i].to_string())
            .collect(),
    )
}
