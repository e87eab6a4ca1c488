//! The normalized event model and the formatted log-line wire format.
//!
//! Both stream parsers produce [`StreamEvent`]s; the manager projects each
//! event into a raw text line (`[HH:MM:SS skill] message`) and a structured
//! [`LogEntry`]. The text line doubles as the persistence format: saved log
//! tails are reverse-parsed with [`parse_line`] when buffers are re-seeded.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized unit of subprocess output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant message text.
    Text(String),
    /// Tool invocation with its raw input.
    ToolUse { name: String, input: Value },
    /// Output produced by a tool invocation.
    ToolResult(String),
    /// Final result, with usage when the source reports it.
    Result {
        text: String,
        usage: Option<UsageData>,
    },
    /// Provider or agent error text.
    Error(String),
    /// A user message echoed back by the agent.
    User(String),
    /// Anything unrecognized, preserved verbatim.
    Raw(String),
}

/// Token counts and dollar cost attached to a Result event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

impl UsageData {
    /// Build usage data; `total` falls back to `input + output` when the
    /// source doesn't supply it directly.
    pub fn new(input: u64, output: u64, total: Option<u64>, cost_usd: f64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: total.unwrap_or(input + output),
            cost_usd,
        }
    }
}

/// Event type of a structured log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Text,
    ToolUse,
    ToolResult,
    Result,
    Error,
    User,
    Raw,
}

/// A display-ready projection of one stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: NaiveTime,
    pub skill: String,
    pub kind: LogKind,
    /// One-line summary, truncated per kind.
    pub summary: String,
    /// Multi-line detail when the source content doesn't fit one line.
    #[serde(default)]
    pub detail: Option<String>,
    /// False while content is still streaming in (e.g. a tool call whose
    /// result hasn't arrived yet).
    pub complete: bool,
}

const SUMMARY_MAX: usize = 120;

/// Truncate to the first line, capped at `SUMMARY_MAX` characters.
fn summarize(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    if first.chars().count() <= SUMMARY_MAX {
        first.to_string()
    } else {
        let cut: String = first.chars().take(SUMMARY_MAX).collect();
        format!("{cut}…")
    }
}

fn detail_for(text: &str, summary: &str) -> Option<String> {
    if text == summary {
        None
    } else {
        Some(text.to_string())
    }
}

impl LogEntry {
    pub fn from_event(timestamp: NaiveTime, skill: &str, event: &StreamEvent) -> Self {
        let (kind, text, complete) = match event {
            StreamEvent::Text(t) => (LogKind::Text, t.clone(), true),
            StreamEvent::ToolUse { name, input } => {
                let compact = serde_json::to_string(input).unwrap_or_default();
                (LogKind::ToolUse, format!("{name} {compact}"), false)
            }
            StreamEvent::ToolResult(t) => (LogKind::ToolResult, t.clone(), true),
            StreamEvent::Result { text, .. } => (LogKind::Result, text.clone(), true),
            StreamEvent::Error(t) => (LogKind::Error, t.clone(), true),
            StreamEvent::User(t) => (LogKind::User, t.clone(), true),
            StreamEvent::Raw(t) => (LogKind::Raw, t.clone(), true),
        };
        let summary = summarize(&text);
        let detail = detail_for(&text, &summary);
        Self {
            timestamp,
            skill: skill.to_string(),
            kind,
            summary,
            detail,
            complete,
        }
    }
}

// ── Formatted log lines ─────────────────────────────────────────────────

pub const TOOL_PREFIX: &str = "Tool: ";
pub const RESULT_PREFIX: &str = "Result: ";
pub const ERROR_PREFIX: &str = "ERROR: ";
pub const RATE_LIMIT_PREFIX: &str = "RATE LIMITED: ";
pub const USER_PREFIX: &str = "User: ";
pub const COMPLETED_MESSAGE: &str = "Completed";

/// Render the message portion of a log line for one event.
///
/// Rate-limit classification is the caller's business: a rate-limited error
/// should be formatted with [`RATE_LIMIT_PREFIX`] instead.
pub fn event_message(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Text(t) | StreamEvent::ToolResult(t) | StreamEvent::Raw(t) => single_line(t),
        StreamEvent::ToolUse { name, input } => {
            let compact = serde_json::to_string(input).unwrap_or_default();
            format!("{TOOL_PREFIX}{name} {compact}")
        }
        StreamEvent::Result { text, .. } => format!("{RESULT_PREFIX}{}", single_line(text)),
        StreamEvent::Error(t) => format!("{ERROR_PREFIX}{}", single_line(t)),
        StreamEvent::User(t) => format!("{USER_PREFIX}{}", single_line(t)),
    }
}

fn single_line(text: &str) -> String {
    if text.contains('\n') {
        text.replace('\n', " ")
    } else {
        text.to_string()
    }
}

/// Format a full log line: `[HH:MM:SS skill] message` (skill omitted when
/// empty). This exact shape is both the buffer content and the persistence
/// wire format.
pub fn format_line(time: NaiveTime, skill: &str, message: &str) -> String {
    let stamp = time.format("%H:%M:%S");
    if skill.is_empty() {
        format!("[{stamp}] {message}")
    } else {
        format!("[{stamp} {skill}] {message}")
    }
}

/// Reverse-parse a formatted log line back into a [`LogEntry`].
///
/// Returns `None` for rate-limit-prefixed lines (intentionally excluded from
/// the structured view) and for lines that don't carry the
/// `[HH:MM:SS[ skill]]` header.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let rest = line.strip_prefix('[')?;
    let close = rest.find(']')?;
    let header = &rest[..close];
    let message = rest[close + 1..].strip_prefix(' ')?;

    let (stamp, skill) = match header.split_once(' ') {
        Some((stamp, skill)) => (stamp, skill),
        None => (header, ""),
    };
    let timestamp = NaiveTime::parse_from_str(stamp, "%H:%M:%S").ok()?;

    if message.starts_with(RATE_LIMIT_PREFIX) {
        return None;
    }

    let (kind, text) = if let Some(rest) = message.strip_prefix(TOOL_PREFIX) {
        (LogKind::ToolUse, rest)
    } else if let Some(rest) = message.strip_prefix(RESULT_PREFIX) {
        (LogKind::Result, rest)
    } else if let Some(rest) = message.strip_prefix(ERROR_PREFIX) {
        (LogKind::Error, rest)
    } else if let Some(rest) = message.strip_prefix(USER_PREFIX) {
        (LogKind::User, rest)
    } else if message == COMPLETED_MESSAGE {
        (LogKind::Result, message)
    } else {
        (LogKind::Text, message)
    };

    let summary = summarize(text);
    let detail = detail_for(text, &summary);
    Some(LogEntry {
        timestamp,
        skill: skill.to_string(),
        kind,
        summary,
        detail,
        complete: true,
    })
}
