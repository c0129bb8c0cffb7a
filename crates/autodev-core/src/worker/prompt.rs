//! Startup prompt assembly for workers.
//!
//! The prompt dispatched to a fresh agent is built in layers: an optional
//! persona prompt (a Markdown file under the project's prompt directory),
//! an optional mandatory-delegation hint, the opening directive naming
//! the task and the plan file, and -- for integration tasks -- the open
//! issues digest. A task interrupted mid-edit by an API error gets a
//! recovery prompt instead of the standard directive.

use std::path::Path;

use tracing::warn;

use crate::task::{Persona, PersonaProvider, Task, TaskKind};

/// MCP tool identifiers the primary agent must call when a task is
/// delegated to another provider.
pub const GEMINI_DELEGATE_TOOL: &str = "mcp__gemini-cli__ask-gemini";
pub const CODEX_DELEGATE_TOOL: &str = "mcp__codex__codex";

/// Inputs for one spawn's prompt.
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub plan_path: &'a Path,
    pub project_root: &'a Path,
    /// Open-issues digest, present for integration tasks.
    pub issue_digest: Option<String>,
}

/// Build the full startup prompt for a worker, honoring the spawn order:
/// persona prefix, then delegation hint, then directive (or the
/// API-error recovery directive), then the issue digest.
pub fn build_startup_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(persona) = &inputs.task.persona {
        if let Some(text) = load_persona_prompt(inputs.project_root, persona) {
            sections.push(text);
        }
    }

    if let Some(provider) = delegation_provider(inputs.task) {
        sections.push(delegation_hint(inputs.task, provider));
    }

    if inputs.task.has_modified_code || inputs.task.is_api_error_recovery {
        let block = crate::plan::extract_task_content(inputs.plan_path, &inputs.task.id)
            .ok()
            .flatten();
        sections.push(recovery_directive(inputs.task, inputs.plan_path, block.as_deref()));
    } else {
        sections.push(opening_directive(inputs.task, inputs.plan_path));
    }

    if let Some(digest) = &inputs.issue_digest {
        sections.push(digest.clone());
    }

    sections.join("\n\n")
}

/// The fixed opening directive naming the task id and the plan file.
fn opening_directive(task: &Task, plan_path: &Path) -> String {
    format!(
        "You are an autonomous coding agent executing exactly one task.\n\
         Task: {id} -- {title}\n\
         Plan file: {plan}\n\n\
         Read the task's block in the plan file for the full requirements, \
         complete every checklist item, and keep your changes scoped to this task.\n\
         Report defects you cannot fix as a single line:\n\
         AUTO_DEV_ISSUE: {{\"title\":\"...\",\"severity\":\"warning|error|blocker\",\"files\":[\"...\"]}}",
        id = task.id,
        title = task.title,
        plan = plan_path.display(),
    )
}

/// Recovery directive for a task whose previous run was interrupted by an
/// API error after it had already modified code. Carries the task's own
/// block from the plan file when it can be extracted.
fn recovery_directive(task: &Task, plan_path: &Path, block: Option<&str>) -> String {
    let mut out = format!(
        "A previous run of task {id} was interrupted by an API error and may \
         have left partial edits behind.\n\
         Before doing anything else: run `git status` and `git diff`, inspect \
         the partial changes, and repair or complete them.\n\
         Then resume the task as specified in its block in {plan}.\n\
         Task: {id} -- {title}",
        id = task.id,
        title = task.title,
        plan = plan_path.display(),
    );
    if let Some(block) = block {
        out.push_str("\n\nThe task block, for reference:\n\n");
        out.push_str(block);
    }
    out
}

/// Which provider this task delegates to, if any: an explicit persona
/// provider wins, otherwise the derived task kind decides.
pub fn delegation_provider(task: &Task) -> Option<PersonaProvider> {
    match task.persona.as_ref().map(|p| p.provider) {
        Some(PersonaProvider::Gemini) => return Some(PersonaProvider::Gemini),
        Some(PersonaProvider::Codex) => return Some(PersonaProvider::Codex),
        Some(PersonaProvider::Shared) | None => {}
    }
    match task.kind {
        TaskKind::Frontend => Some(PersonaProvider::Gemini),
        TaskKind::Audit => Some(PersonaProvider::Codex),
        _ => None,
    }
}

fn delegation_hint(task: &Task, provider: PersonaProvider) -> String {
    let tool = match provider {
        PersonaProvider::Gemini => GEMINI_DELEGATE_TOOL,
        PersonaProvider::Codex => CODEX_DELEGATE_TOOL,
        PersonaProvider::Shared => return String::new(),
    };
    format!(
        "MANDATORY DELEGATION: task {id} is assigned to the {provider} model. \
         You MUST perform the substantive work of this task by calling the \
         `{tool}` tool; do not implement it yourself.",
        id = task.id,
    )
}

/// Load a persona prompt from
/// `<projectRoot>/.claude/prompts/personas/<provider>/<name>.md`.
///
/// Provider whitelisting and the name pattern are enforced by
/// [`Persona::parse`]; anything unreadable here is skipped with a
/// warning.
pub fn load_persona_prompt(project_root: &Path, persona: &Persona) -> Option<String> {
    let path = project_root
        .join(".claude")
        .join("prompts")
        .join("personas")
        .join(persona.provider.to_string())
        .join(format!("{}.md", persona.name));

    match std::fs::read_to_string(&path) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(
                persona = %persona,
                path = %path.display(),
                error = %e,
                "persona prompt unavailable, continuing without it"
            );
            None
        }
    }
}
