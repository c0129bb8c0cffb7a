//! Plan file (AUTO-DEV.md) parser.
//!
//! Parses a UTF-8 Markdown plan into tasks, waves, dependencies, and
//! metadata. Fenced code blocks are masked before any pattern matching so
//! examples and templates can never be admitted as tasks. A missing file
//! yields an empty plan; other I/O errors propagate. Parsing is
//! deterministic: the same bytes always produce the same output.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::task::{
    DEFAULT_WAVE, Persona, Task, TaskScope, TaskStatus, TASK_ID_RE, canonical_task_id,
    is_task_id,
};

use super::mask::mask_fenced_blocks;

/// Errors from plan parsing. Malformed constructs inside the file are
/// skipped with a warning, never an error.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of parsing a plan file: tasks in document order plus the wave
/// map (wave number to member task ids).
#[derive(Debug, Clone, Default)]
pub struct ParsedPlan {
    pub tasks: Vec<Task>,
    pub waves: BTreeMap<u32, Vec<String>>,
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

static TASK_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^###\s+(?:Task:\s*)?(\w+[.-]\w+(?:[.-]\w+)*)\s*[:：\s]\s*(.*?)\s*$")
        .unwrap()
});

static ANY_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{2,3}\s").unwrap());

static WAVE_SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##\s+Wave\s+(\d+)\b").unwrap());

static WAVE_INLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Wave\s+(\d+)\s*[:：]\s*(.*)$").unwrap());

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-+*]\s*\[([ xX~!])\]").unwrap());

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-+*]\s+)?\*\*([^*\n]+)\*\*\s*[:：]\s*(.+?)\s*$").unwrap()
});

static PAREN_NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)|（[^）]*）").unwrap());

static ESTIMATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*([kK])?").unwrap());

/// Field names that make an otherwise bare heading block a real task.
const RECOGNIZED_FIELDS: &[&str] = &["状态", "依赖", "预估上下文", "Persona", "Scope", "输出"];

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse a plan file from disk. A missing file is treated as an empty
/// plan; any other I/O failure propagates.
pub fn parse_plan_file(path: &Path) -> Result<ParsedPlan, PlanParseError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ParsedPlan::default());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(parse_plan_str(&text))
}

/// Parse plan text that is already in memory.
pub fn parse_plan_str(text: &str) -> ParsedPlan {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let masked = mask_fenced_blocks(text);

    // Inline wave lists take precedence over section headings.
    let inline_waves = collect_inline_waves(&masked);
    let wave_sections = collect_wave_sections(&masked);

    let mut tasks: Vec<Task> = Vec::new();
    let mut seen_ids: Vec<String> = Vec::new();

    let headings: Vec<(usize, usize, String, String)> = TASK_HEADING_RE
        .captures_iter(&masked)
        .map(|caps| {
            let m = caps.get(0).unwrap();
            let id = canonical_task_id(caps.get(1).unwrap().as_str());
            let title = caps.get(2).unwrap().as_str().trim().to_string();
            (m.start(), m.end(), id, title)
        })
        .collect();

    for (start, heading_end, id, title) in &headings {
        // The block runs from the end of the heading line to the next
        // ##/### heading or EOF.
        let block_end = ANY_HEADING_RE
            .find_at(&masked, *heading_end)
            .map(|m| m.start())
            .unwrap_or(masked.len());
        let block = &masked[*heading_end..block_end];

        if !is_admissible_block(block) {
            continue;
        }

        if seen_ids.contains(id) {
            warn!(task_id = %id, "duplicate task id in plan, keeping the first");
            continue;
        }
        seen_ids.push(id.clone());

        let mut task = Task::new(id.clone(), if title.is_empty() { id.clone() } else { title.clone() });

        apply_block_fields(&mut task, block);

        // Wave resolution: inline list > section heading > default.
        task.wave = inline_waves
            .get(&task.id)
            .copied()
            .or_else(|| wave_for_offset(&wave_sections, *start))
            .unwrap_or(DEFAULT_WAVE);

        tasks.push(task);
    }

    let mut waves: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for task in &tasks {
        waves.entry(task.wave).or_default().push(task.id.clone());
    }

    ParsedPlan { tasks, waves }
}

/// Return the raw (unmasked) block text for one task id, used to build
/// recovery prompts. `None` when the file or the heading is missing.
pub fn extract_task_content(path: &Path, task_id: &str) -> Result<Option<String>, PlanParseError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let masked = mask_fenced_blocks(text);
    let wanted = canonical_task_id(task_id);

    for caps in TASK_HEADING_RE.captures_iter(&masked) {
        let id = canonical_task_id(caps.get(1).unwrap().as_str());
        if id != wanted {
            continue;
        }
        let m = caps.get(0).unwrap();
        let block_end = ANY_HEADING_RE
            .find_at(&masked, m.end())
            .map(|h| h.start())
            .unwrap_or(masked.len());
        return Ok(Some(text[m.start()..block_end].to_string()));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn collect_inline_waves(masked: &str) -> BTreeMap<String, u32> {
    let mut map = BTreeMap::new();
    for caps in WAVE_INLINE_RE.captures_iter(masked) {
        let Ok(wave) = caps.get(1).unwrap().as_str().parse::<u32>() else {
            continue;
        };
        let rest = caps.get(2).unwrap().as_str();
        for id_match in TASK_ID_RE.find_iter(rest) {
            let id = canonical_task_id(id_match.as_str());
            map.entry(id).or_insert(wave);
        }
    }
    map
}

/// `(byte offset, wave)` of each `## Wave N` heading, in document order.
fn collect_wave_sections(masked: &str) -> Vec<(usize, u32)> {
    WAVE_SECTION_RE
        .captures_iter(masked)
        .filter_map(|caps| {
            let wave = caps.get(1).unwrap().as_str().parse::<u32>().ok()?;
            Some((caps.get(0).unwrap().start(), wave))
        })
        .collect()
}

/// The wave of the last `## Wave N` heading before `offset`, if any.
fn wave_for_offset(sections: &[(usize, u32)], offset: usize) -> Option<u32> {
    sections
        .iter()
        .take_while(|(start, _)| *start < offset)
        .last()
        .map(|(_, wave)| *wave)
}

/// A heading block is admitted as a task only if it shows at least one
/// checkbox, a status/deps field, or a recognized metadata field.
fn is_admissible_block(block: &str) -> bool {
    if CHECKBOX_RE.is_match(block) {
        return true;
    }
    FIELD_RE.captures_iter(block).any(|caps| {
        let name = caps.get(1).unwrap().as_str().trim();
        RECOGNIZED_FIELDS
            .iter()
            .any(|f| name.eq_ignore_ascii_case(f) || name == *f)
    })
}

fn apply_block_fields(task: &mut Task, block: &str) {
    let mut explicit_status: Option<TaskStatus> = None;

    for caps in FIELD_RE.captures_iter(block) {
        let name = caps.get(1).unwrap().as_str().trim();
        let value = caps.get(2).unwrap().as_str().trim();

        if name == "依赖" || name.eq_ignore_ascii_case("depends") || name.eq_ignore_ascii_case("dependencies") {
            task.dependencies = parse_dependencies(value);
        } else if name == "状态" || name.eq_ignore_ascii_case("status") {
            explicit_status = status_from_text(value);
        } else if name == "预估上下文" || name.eq_ignore_ascii_case("estimate") {
            task.estimated_tokens = parse_token_estimate(value);
        } else if name.eq_ignore_ascii_case("persona") {
            match Persona::parse(value) {
                Ok(p) => task.persona = Some(p),
                Err(e) => warn!(task_id = %task.id, error = %e, "skipping invalid persona"),
            }
        } else if name.eq_ignore_ascii_case("scope") {
            match TaskScope::from_str(value) {
                Ok(s) => task.scope = Some(s),
                Err(()) => warn!(task_id = %task.id, value, "skipping unrecognized scope"),
            }
        } else {
            task.metadata.insert(name.to_string(), value.to_string());
        }
    }

    // Explicit status text wins; otherwise the first checkbox mark.
    task.status = explicit_status
        .or_else(|| {
            CHECKBOX_RE
                .captures(block)
                .and_then(|caps| status_from_checkbox(caps.get(1).unwrap().as_str()))
        })
        .unwrap_or(TaskStatus::Pending);
}

/// Strip parenthetical notes, split on commas, canonicalize, and dedupe
/// preserving order.
fn parse_dependencies(value: &str) -> Vec<String> {
    let cleaned = PAREN_NOTE_RE.replace_all(value, "");
    let mut out: Vec<String> = Vec::new();
    for part in cleaned.split([',', '，']) {
        let id = canonical_task_id(part.trim_matches(|c: char| {
            c.is_whitespace() || c == '[' || c == ']' || c == '`'
        }));
        if id.is_empty() || !is_task_id(&id) {
            continue;
        }
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

fn status_from_text(value: &str) -> Option<TaskStatus> {
    let v = value.to_lowercase();
    if v.contains("已完成") || v.contains("success") || v.contains("completed") || v.contains("done") {
        Some(TaskStatus::Success)
    } else if v.contains("失败") || v.contains("failed") {
        Some(TaskStatus::Failed)
    } else if v.contains("blocked") || v.contains("阻塞") {
        // Blocked reads as pending; dependency satisfaction recomputes it.
        Some(TaskStatus::Pending)
    } else if v.contains("进行中") || v.contains("running") || v.contains("in progress") {
        Some(TaskStatus::Running)
    } else if v.contains("待") || v.contains("pending") || v.contains("ready") {
        Some(TaskStatus::Ready)
    } else {
        None
    }
}

fn status_from_checkbox(mark: &str) -> Option<TaskStatus> {
    match mark {
        "x" | "X" => Some(TaskStatus::Success),
        "~" => Some(TaskStatus::Running),
        "!" => Some(TaskStatus::Pending),
        " " => Some(TaskStatus::Ready),
        _ => None,
    }
}

fn parse_token_estimate(value: &str) -> Option<u64> {
    let caps = ESTIMATE_RE.captures(value)?;
    let num: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = if caps.get(2).is_some() { 1_000.0 } else { 1.0 };
    Some((num * multiplier) as u64)
}
