//! Parsing of newline-delimited `stream-json` output.
//!
//! Claude Code (and compatible CLIs) emit one JSON object per line with a
//! top-level `type` discriminator. The interesting shapes:
//!
//! ```text
//! {"type":"assistant","message":{"content":[{"type":"text",...},
//!                                           {"type":"tool_use","id":...,"name":...,"input":...}]}}
//! {"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":...,"is_error":...}]}}
//! {"type":"result","subtype":"success","result":"...","is_error":false}
//! {"type":"error","error":{"message":"..."}}
//! ```
//!
//! Anything that fails to parse as JSON is treated as a plain text line.

use serde_json::Value;

/// The structured pieces extracted from one stream-json line.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Full JSON payload of the line.
    pub value: Value,
    /// Top-level `type` discriminator.
    pub frame_type: String,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub is_error: bool,
    /// Progress fraction, when the frame carries one.
    pub progress: Option<f64>,
}

/// Parse a single line. Returns `None` when the line is not JSON or has no
/// `type` discriminator; callers store it as an unstructured message.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let value: Value = serde_json::from_str(line).ok()?;
    let frame_type = value.get("type")?.as_str()?.to_string();

    let mut tool_name = None;
    let mut tool_use_id = None;
    let mut is_error = false;
    let mut progress = None;

    match frame_type.as_str() {
        "assistant" | "user" => {
            if let Some(blocks) = value
                .pointer("/message/content")
                .and_then(Value::as_array)
            {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("tool_use") => {
                            tool_name = block
                                .get("name")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            tool_use_id = block
                                .get("id")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                        }
                        Some("tool_result") => {
                            tool_use_id = block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            is_error |= block
                                .get("is_error")
                                .and_then(Value::as_bool)
                                .unwrap_or(false);
                        }
                        _ => {}
                    }
                }
            }
        }
        "result" => {
            is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| {
                    value
                        .get("subtype")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s != "success")
                });
        }
        "error" => {
            is_error = true;
        }
        "progress" => {
            progress = value.get("value").and_then(Value::as_f64);
        }
        _ => {}
    }

    Some(Frame {
        value,
        frame_type,
        tool_name,
        tool_use_id,
        is_error,
        progress,
    })
}

/// Extract the plan markdown from an `ExitPlanMode` tool_use frame, if the
/// given payload is one.
pub fn extract_plan(value: &Value) -> Option<String> {
    if value.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let blocks = value.pointer("/message/content")?.as_array()?;
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_use")
            && block.get("name").and_then(Value::as_str) == Some("ExitPlanMode")
        {
            return block
                .pointer("/input/plan")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }
    None
}
