//! `autodev check`: parse a plan file and report its structure and any
//! graph problems without running anything.

use std::path::Path;

use anyhow::Result;

use autodev_core::plan::{parse_plan_file, validate_plan};

pub fn run_check(plan_path: &Path) -> Result<bool> {
    let parsed = parse_plan_file(plan_path)?;

    if parsed.tasks.is_empty() {
        println!("No tasks found in {}.", plan_path.display());
        return Ok(true);
    }

    println!("{}: {} tasks", plan_path.display(), parsed.tasks.len());
    for (wave, ids) in &parsed.waves {
        println!("  wave {wave}: {}", ids.join(", "));
    }
    println!();

    for task in &parsed.tasks {
        let deps = if task.dependencies.is_empty() {
            "-".to_string()
        } else {
            task.dependencies.join(", ")
        };
        println!(
            "  {:<16} wave {:<3} status {:<8} kind {:<11} deps {}",
            task.id, task.wave, task.status.to_string(), task.kind.to_string(), deps
        );
    }

    let diagnostics = validate_plan(&parsed.tasks);
    if diagnostics.is_empty() {
        println!("\nGraph OK: no unknown dependencies, no cycles.");
        return Ok(true);
    }

    println!("\nProblems:");
    for diagnostic in &diagnostics {
        println!("  - {diagnostic}");
    }
    Ok(false)
}
