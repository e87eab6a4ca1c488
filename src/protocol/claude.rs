//! Parser for claude's `--output-format stream-json` vocabulary.
//!
//! Message shapes are deliberately tolerant: unknown fields are flattened
//! away and missing ones default, so vendor additions don't break parsing.
//! A line that doesn't deserialize at all becomes a `Raw` event.

use serde::Deserialize;
use serde_json::Value;

use super::LineParser;
use crate::event::{StreamEvent, UsageData};

/// Top-level inbound line from claude's stream-json output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundLine {
    #[serde(rename = "system")]
    System {
        #[serde(flatten)]
        _extra: Value,
    },
    #[serde(rename = "assistant")]
    Assistant { message: AssistantBody },
    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<Value>,
        #[serde(default)]
        message: Option<Value>,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: String,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        total_cost_usd: f64,
    },
    #[serde(rename = "rate_limit_event")]
    RateLimit { rate_limit_info: RateLimitInfo },
}

#[derive(Debug, Deserialize)]
struct AssistantBody {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(flatten)]
    _extra: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(flatten)]
    _extra: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    rate_limit_type: String,
    #[serde(flatten)]
    _extra: Value,
}

pub struct ClaudeParser;

impl ClaudeParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClaudeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for ClaudeParser {
    fn parse_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let Ok(parsed) = serde_json::from_str::<InboundLine>(line) else {
            return vec![StreamEvent::Raw(line.to_string())];
        };
        match parsed {
            InboundLine::System { .. } => Vec::new(),
            InboundLine::Assistant { message } => message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        Some(StreamEvent::Text(text))
                    }
                    ContentBlock::ToolUse { name, input } => {
                        Some(StreamEvent::ToolUse { name, input })
                    }
                    _ => None,
                })
                .collect(),
            InboundLine::User {
                tool_use_result,
                message,
            } => {
                if let Some(result) = tool_use_result {
                    return vec![StreamEvent::ToolResult(value_text(&result))];
                }
                match message.as_ref().and_then(extract_text) {
                    Some(text) => vec![StreamEvent::User(text)],
                    None => Vec::new(),
                }
            }
            InboundLine::Result {
                result,
                usage,
                total_cost_usd,
            } => {
                let usage = usage
                    .map(|u| UsageData::new(u.input_tokens, u.output_tokens, None, total_cost_usd));
                vec![StreamEvent::Result {
                    text: result,
                    usage,
                }]
            }
            InboundLine::RateLimit { rate_limit_info } => {
                if rate_limit_info.status == "allowed" {
                    return Vec::new();
                }
                vec![StreamEvent::Error(format!(
                    "rate limit ({}): status {}",
                    rate_limit_info.rate_limit_type, rate_limit_info.status
                ))]
            }
        }
    }
}

/// Render a tool result value as text: strings verbatim, everything else as
/// compact JSON.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull displayable text out of a user message: either a bare string or the
/// standard `{content: [{type: "text", text: ...}]}` shape.
fn extract_text(message: &Value) -> Option<String> {
    if let Value::String(s) = message {
        if s.is_empty() {
            return None;
        }
        return Some(s.clone());
    }
    let content = message.get("content")?;
    if let Value::String(s) = content {
        if s.is_empty() {
            return None;
        }
        return Some(s.clone());
    }
    let parts: Vec<&str> = content
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: &str) -> Vec<StreamEvent> {
        ClaudeParser::new().parse_line(line)
    }

    #[test]
    fn assistant_text_becomes_text_event() {
        let events = parse(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#,
        );
        assert_eq!(events, vec![StreamEvent::Text("hello".into())]);
    }

    #[test]
    fn assistant_tool_use_becomes_tool_event() {
        let events = parse(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert_eq!(
            events,
            vec![StreamEvent::ToolUse {
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            }]
        );
    }

    #[test]
    fn mixed_content_emits_in_order() {
        let events = parse(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"running"},{"type":"tool_use","id":"t1","name":"Read","input":{}},{"type":"thinking","thinking":"hm"}]}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Text(_)));
        assert!(matches!(events[1], StreamEvent::ToolUse { .. }));
    }

    #[test]
    fn result_carries_usage_with_summed_total() {
        let events = parse(
            r#"{"type":"result","subtype":"success","result":"all done","total_cost_usd":0.01,"usage":{"input_tokens":100,"output_tokens":50}}"#,
        );
        match &events[0] {
            StreamEvent::Result { text, usage } => {
                assert_eq!(text, "all done");
                let usage = usage.unwrap();
                assert_eq!(usage.total_tokens, 150);
                assert!((usage.cost_usd - 0.01).abs() < 1e-9);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn user_tool_result_becomes_tool_result() {
        let events = parse(r#"{"type":"user","tool_use_result":"file contents"}"#);
        assert_eq!(events, vec![StreamEvent::ToolResult("file contents".into())]);
    }

    #[test]
    fn user_message_text_extracted() {
        let events = parse(
            r#"{"type":"user","message":{"content":[{"type":"text","text":"please continue"}]}}"#,
        );
        assert_eq!(events, vec![StreamEvent::User("please continue".into())]);
    }

    #[test]
    fn empty_user_message_yields_nothing() {
        assert!(parse(r#"{"type":"user","message":{"content":[]}}"#).is_empty());
        assert!(parse(r#"{"type":"user"}"#).is_empty());
    }

    #[test]
    fn allowed_rate_limit_suppressed() {
        let events = parse(
            r#"{"type":"rate_limit_event","rate_limit_info":{"status":"allowed","rateLimitType":"five_hour"}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn rejected_rate_limit_becomes_error() {
        let events = parse(
            r#"{"type":"rate_limit_event","rate_limit_info":{"status":"rejected","rateLimitType":"five_hour"}}"#,
        );
        match &events[0] {
            StreamEvent::Error(text) => {
                assert!(text.contains("rate limit"));
                assert!(text.contains("five_hour"));
                assert!(text.contains("rejected"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn system_lines_are_silent() {
        assert!(parse(r#"{"type":"system","subtype":"init","session_id":"s1"}"#).is_empty());
    }

    #[test]
    fn malformed_line_demoted_to_raw() {
        let events = parse("not json at all");
        assert_eq!(events, vec![StreamEvent::Raw("not json at all".into())]);
        let events = parse(r#"{"type":"brand_new_event"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Raw(r#"{"type":"brand_new_event"}"#.into())]
        );
    }

    #[test]
    fn unknown_fields_tolerated() {
        let events = parse(
            r#"{"type":"result","result":"ok","total_cost_usd":0.0,"unknown_field":123,"another":"x"}"#,
        );
        assert!(matches!(events[0], StreamEvent::Result { .. }));
    }
}
