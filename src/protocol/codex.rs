//! Parser for codex's `--json` event vocabulary.
//!
//! Codex wraps every event as `{"id": ..., "msg": {"type": ...}}`. Unlike
//! claude, the final result is split across two lines: `token_count` carries
//! usage and `task_complete` carries the closing message, so the parser
//! holds the most recent usage until the task completes.

use serde::Deserialize;
use serde_json::json;

use super::LineParser;
use crate::event::{StreamEvent, UsageData};

#[derive(Debug, Deserialize)]
struct EventLine {
    #[serde(default, rename = "id")]
    _id: Option<String>,
    msg: EventMsg,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventMsg {
    AgentMessage {
        #[serde(default)]
        message: String,
    },
    UserMessage {
        #[serde(default)]
        message: String,
    },
    ExecCommandBegin {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    ExecCommandEnd {
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: i32,
    },
    TokenCount {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        total_tokens: Option<u64>,
        #[serde(default)]
        info: Option<TokenCountInfo>,
    },
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    /// Recognized envelope, uninteresting payload (task_started,
    /// agent_reasoning, turn_diff, ...). Deliberately silent.
    #[serde(other)]
    Other,
}

/// Newer codex builds nest usage under `info.total_token_usage`.
#[derive(Debug, Deserialize)]
struct TokenCountInfo {
    #[serde(default)]
    total_token_usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Default)]
pub struct CodexParser {
    /// Usage from the latest token_count, consumed by task_complete.
    pending_usage: Option<UsageData>,
}

impl CodexParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for CodexParser {
    fn parse_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let Ok(parsed) = serde_json::from_str::<EventLine>(line) else {
            return vec![StreamEvent::Raw(line.to_string())];
        };
        match parsed.msg {
            EventMsg::AgentMessage { message } => {
                if message.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::Text(message)]
                }
            }
            EventMsg::UserMessage { message } => {
                if message.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::User(message)]
                }
            }
            EventMsg::ExecCommandBegin { command, cwd } => {
                let mut input = json!({ "command": command.join(" ") });
                if let Some(cwd) = cwd {
                    input["cwd"] = json!(cwd);
                }
                vec![StreamEvent::ToolUse {
                    name: "shell".to_string(),
                    input,
                }]
            }
            EventMsg::ExecCommandEnd {
                stdout,
                stderr,
                exit_code,
            } => {
                // The command's synchronous output rides in the same event.
                let text = if exit_code == 0 {
                    stdout
                } else if stderr.is_empty() {
                    format!("exit {exit_code}: {stdout}")
                } else {
                    format!("exit {exit_code}: {stderr}")
                };
                vec![StreamEvent::ToolResult(text)]
            }
            EventMsg::TokenCount {
                input_tokens,
                output_tokens,
                total_tokens,
                info,
            } => {
                let usage = match info.and_then(|i| i.total_token_usage) {
                    Some(u) => UsageData::new(u.input_tokens, u.output_tokens, u.total_tokens, 0.0),
                    None => UsageData::new(input_tokens, output_tokens, total_tokens, 0.0),
                };
                self.pending_usage = Some(usage);
                Vec::new()
            }
            EventMsg::TaskComplete { last_agent_message } => {
                vec![StreamEvent::Result {
                    text: last_agent_message.unwrap_or_default(),
                    usage: self.pending_usage.take(),
                }]
            }
            EventMsg::Error { message } => vec![StreamEvent::Error(message)],
            EventMsg::Other => Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn agent_message_becomes_text() {
        let mut p = CodexParser::new();
        let events =
            p.parse_line(r#"{"id":"0","msg":{"type":"agent_message","message":"working on it"}}"#);
        assert_eq!(events, vec![StreamEvent::Text("working on it".into())]);
    }

    #[test]
    fn exec_begin_and_end_become_tool_pair() {
        let mut p = CodexParser::new();
        let begin = p.parse_line(
            r#"{"id":"1","msg":{"type":"exec_command_begin","command":["ls","-la"],"cwd":"/tmp"}}"#,
        );
        match &begin[0] {
            StreamEvent::ToolUse { name, input } => {
                assert_eq!(name, "shell");
                assert_eq!(input["command"], "ls -la");
                assert_eq!(input["cwd"], "/tmp");
            }
            other => panic!("expected tool use, got {other:?}"),
        }

        let end = p.parse_line(
            r#"{"id":"1","msg":{"type":"exec_command_end","stdout":"total 0\n","stderr":"","exit_code":0}}"#,
        );
        assert_eq!(end, vec![StreamEvent::ToolResult("total 0\n".into())]);
    }

    #[test]
    fn failed_exec_reports_exit_code_and_stderr() {
        let mut p = CodexParser::new();
        let end = p.parse_line(
            r#"{"id":"1","msg":{"type":"exec_command_end","stdout":"","stderr":"no such file","exit_code":2}}"#,
        );
        assert_eq!(
            end,
            vec![StreamEvent::ToolResult("exit 2: no such file".into())]
        );
    }

    #[test]
    fn token_count_is_carried_into_task_complete() {
        let mut p = CodexParser::new();
        let counted = p.parse_line(
            r#"{"id":"2","msg":{"type":"token_count","input_tokens":100,"output_tokens":50}}"#,
        );
        assert!(counted.is_empty());

        let done = p.parse_line(
            r#"{"id":"2","msg":{"type":"task_complete","last_agent_message":"done"}}"#,
        );
        match &done[0] {
            StreamEvent::Result { text, usage } => {
                assert_eq!(text, "done");
                assert_eq!(usage.unwrap().total_tokens, 150);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn usage_consumed_once() {
        let mut p = CodexParser::new();
        p.parse_line(
            r#"{"id":"2","msg":{"type":"token_count","input_tokens":10,"output_tokens":5}}"#,
        );
        p.parse_line(r#"{"id":"2","msg":{"type":"task_complete"}}"#);
        let again = p.parse_line(r#"{"id":"3","msg":{"type":"task_complete"}}"#);
        match &again[0] {
            StreamEvent::Result { usage, .. } => assert!(usage.is_none()),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn nested_usage_info_preferred() {
        let mut p = CodexParser::new();
        p.parse_line(
            r#"{"id":"2","msg":{"type":"token_count","info":{"total_token_usage":{"input_tokens":7,"output_tokens":3,"total_tokens":12}}}}"#,
        );
        let done = p.parse_line(r#"{"id":"2","msg":{"type":"task_complete"}}"#);
        match &done[0] {
            StreamEvent::Result { usage, .. } => assert_eq!(usage.unwrap().total_tokens, 12),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn error_message_becomes_error() {
        let mut p = CodexParser::new();
        let events = p.parse_line(r#"{"id":"4","msg":{"type":"error","message":"stream error"}}"#);
        assert_eq!(events, vec![StreamEvent::Error("stream error".into())]);
    }

    #[test]
    fn recognized_but_uninteresting_events_are_silent() {
        let mut p = CodexParser::new();
        assert!(
            p.parse_line(r#"{"id":"5","msg":{"type":"task_started"}}"#)
                .is_empty()
        );
        assert!(
            p.parse_line(r#"{"id":"5","msg":{"type":"agent_reasoning","text":"..."}}"#)
                .is_empty()
        );
    }

    #[test]
    fn malformed_line_demoted_to_raw() {
        let mut p = CodexParser::new();
        let events = p.parse_line("plain stderr noise");
        assert_eq!(events, vec![StreamEvent::Raw("plain stderr noise".into())]);
    }
}
