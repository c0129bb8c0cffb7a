//! JSONL frame parsing for the child agent's stdout protocol.
//!
//! The agent writes one JSON object per line. Four frame types matter:
//! `system` (session lifecycle), `assistant` (nested content blocks plus
//! usage), `user` (tool_result blocks), and the terminal `result`. A line
//! that is not valid JSON is not an error at this layer -- callers log it
//! and keep reading.

use anyhow::{Context, Result};
use serde_json::Value;

/// A decoded event from the agent stream. One stdout line can decode to
/// several frames (an assistant message carries many content blocks).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    /// `system` frame: session id / lifecycle subtype.
    System {
        subtype: Option<String>,
        session_id: Option<String>,
    },
    /// A `text` block inside an assistant message.
    AssistantText { text: String },
    /// A `tool_use` block inside an assistant message.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// A `tool_result` block inside a `user` frame.
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Token usage from `assistant.message.usage`.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
    },
    /// Terminal `result` frame. `subtype == "success"` means success;
    /// anything else is failure.
    Result {
        success: bool,
        subtype: String,
        duration_ms: Option<u64>,
        text: Option<String>,
    },
    /// Recognized JSON with an unknown `type`.
    Unknown { frame_type: String },
}

/// Parse one stdout line into zero or more frames. `Err` means the line
/// was not valid JSON; callers should warn and continue.
pub fn parse_line(line: &str) -> Result<Vec<AgentFrame>> {
    let v: Value = serde_json::from_str(line).context("malformed JSON in agent stream")?;
    let mut frames = Vec::new();

    let frame_type = v.get("type").and_then(Value::as_str).unwrap_or("");
    match frame_type {
        "system" => {
            frames.push(AgentFrame::System {
                subtype: v.get("subtype").and_then(Value::as_str).map(str::to_owned),
                session_id: v
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            });
        }

        "assistant" => {
            if let Some(message) = v.get("message") {
                if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str).unwrap_or("") {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    frames.push(AgentFrame::AssistantText {
                                        text: text.to_owned(),
                                    });
                                }
                            }
                            "tool_use" => {
                                frames.push(AgentFrame::ToolUse {
                                    id: block
                                        .get("id")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default()
                                        .to_owned(),
                                    name: block
                                        .get("name")
                                        .and_then(Value::as_str)
                                        .unwrap_or("unknown")
                                        .to_owned(),
                                    input: block.get("input").cloned().unwrap_or(Value::Null),
                                });
                            }
                            _ => {}
                        }
                    }
                }
                if let Some(usage) = message.get("usage") {
                    let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
                    let (input, output, cache) = (
                        get("input_tokens"),
                        get("output_tokens"),
                        get("cache_read_input_tokens"),
                    );
                    if input > 0 || output > 0 || cache > 0 {
                        frames.push(AgentFrame::Usage {
                            input_tokens: input,
                            output_tokens: output,
                            cache_read_tokens: cache,
                        });
                    }
                }
            }
        }

        "user" => {
            if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
            {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                        frames.push(AgentFrame::ToolResult {
                            tool_use_id: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                            content: tool_result_text(block.get("content")),
                        });
                    }
                }
            }
        }

        "result" => {
            let subtype = v
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned();
            frames.push(AgentFrame::Result {
                success: subtype == "success",
                duration_ms: v.get("duration_ms").and_then(Value::as_u64),
                text: v.get("result").and_then(Value::as_str).map(str::to_owned),
                subtype,
            });
        }

        other => {
            frames.push(AgentFrame::Unknown {
                frame_type: other.to_owned(),
            });
        }
    }

    Ok(frames)
}

/// Flatten a tool_result `content` value, which is either a plain string
/// or an array of `{type: "text", text}` blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| {
                if b.get("type").and_then(Value::as_str) == Some("text") {
                    b.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_frame() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc123"}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::System {
                subtype: Some("init".into()),
                session_id: Some("abc123".into()),
            }]
        );
    }

    #[test]
    fn parses_assistant_text_and_usage() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":1000}}}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], AgentFrame::AssistantText { text: "hi".into() });
        assert_eq!(
            frames[1],
            AgentFrame::Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_tokens: 1000,
            }
        );
    }

    #[test]
    fn parses_tool_use_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"npm install"}}]}}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::ToolUse {
                id: "tu_1".into(),
                name: "Bash".into(),
                input: serde_json::json!({"command": "npm install"}),
            }]
        );
    }

    #[test]
    fn parses_tool_result_string_content() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1","content":"ok"}]}}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::ToolResult {
                tool_use_id: "tu_1".into(),
                content: "ok".into(),
            }]
        );
    }

    #[test]
    fn parses_tool_result_block_array_content() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_2","content":[{"type":"text","text":"line1"},{"type":"text","text":"line2"}]}]}}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::ToolResult {
                tool_use_id: "tu_2".into(),
                content: "line1\nline2".into(),
            }]
        );
    }

    #[test]
    fn parses_success_result() {
        let line = r#"{"type":"result","subtype":"success","duration_ms":4200,"result":"done"}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::Result {
                success: true,
                subtype: "success".into(),
                duration_ms: Some(4200),
                text: Some("done".into()),
            }]
        );
    }

    #[test]
    fn non_success_subtype_is_failure() {
        let line = r#"{"type":"result","subtype":"error_max_turns","duration_ms":100}"#;
        let frames = parse_line(line).unwrap();
        assert!(matches!(
            &frames[0],
            AgentFrame::Result { success: false, subtype, .. } if subtype == "error_max_turns"
        ));
    }

    #[test]
    fn unknown_type_is_reported_not_dropped() {
        let frames = parse_line(r#"{"type":"telemetry","n":1}"#).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::Unknown {
                frame_type: "telemetry".into()
            }]
        );
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_line("not json at all").is_err());
    }

    #[test]
    fn empty_content_produces_no_frames() {
        let frames = parse_line(r#"{"type":"assistant","message":{"content":[]}}"#).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn cache_only_usage_is_still_reported() {
        let line = r#"{"type":"assistant","message":{"content":[],"usage":{"cache_read_input_tokens":5000}}}"#;
        let frames = parse_line(line).unwrap();
        assert_eq!(
            frames,
            vec![AgentFrame::Usage {
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: 5000,
            }]
        );
    }
}
