//! Plan-file handling: Markdown parsing, fence masking, graph
//! diagnostics, and serialized checkbox writeback.

pub mod mask;
pub mod parser;
pub mod validate;
pub mod writeback;

pub use mask::mask_fenced_blocks;
pub use parser::{ParsedPlan, PlanParseError, extract_task_content, parse_plan_file, parse_plan_str};
pub use validate::{PlanDiagnostic, validate_plan};
pub use writeback::{CheckboxUpdate, WritebackQueue, apply_checkbox_update};
