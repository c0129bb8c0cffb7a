//! Fenced-code-block masking for the plan parser.
//!
//! Replaces the body of fenced code blocks (``` or ~~~, CommonMark rules:
//! up to 3 leading spaces, closing fence at least as long as the opener)
//! with spaces of equal byte length. Offsets into the masked text remain
//! valid against the original, so examples inside fences can never be
//! mistaken for real tasks while match indices stay usable.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {0,3}(`{3,}|~{3,})(.*)$").unwrap());

static FENCE_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {0,3}(`{3,}|~{3,})\s*$").unwrap());

/// Mask fenced code block bodies with spaces, preserving byte length and
/// line structure. Fence delimiter lines themselves are left intact (a
/// fence line can never match a task heading). An unclosed fence masks to
/// the end of the input.
pub fn mask_fenced_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    // (fence char, fence length) of the currently open fence.
    let mut open: Option<(char, usize)> = None;

    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);

        match open {
            None => {
                if let Some(caps) = FENCE_OPEN_RE.captures(content) {
                    let fence = caps.get(1).unwrap().as_str();
                    let fence_char = fence.chars().next().unwrap();
                    // A backtick fence's info string may not contain a
                    // backtick (CommonMark); tilde fences are unrestricted.
                    let info = caps.get(2).unwrap().as_str();
                    if fence_char == '~' || !info.contains('`') {
                        open = Some((fence_char, fence.len()));
                    }
                }
                out.push_str(line);
            }
            Some((fence_char, fence_len)) => {
                let closes = FENCE_CLOSE_RE
                    .captures(content)
                    .map(|caps| {
                        let fence = caps.get(1).unwrap().as_str();
                        fence.chars().next() == Some(fence_char) && fence.len() >= fence_len
                    })
                    .unwrap_or(false);

                if closes {
                    open = None;
                    out.push_str(line);
                } else {
                    // Body line: blank out every byte except line endings.
                    for b in line.bytes() {
                        if b == b'\n' || b == b'\r' {
                            out.push(b as char);
                        } else {
                            out.push(' ');
                        }
                    }
                }
            }
        }
    }

    debug_assert_eq!(out.len(), text.len());
    out
}
