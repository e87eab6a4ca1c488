//! Stream parsing: two line-delimited JSON vocabularies, one event model.
//!
//! A [`LineParser`] maps one source line to zero or more [`StreamEvent`]s;
//! [`drive`] owns the shared consumption loop (read a line, check
//! cancellation, emit events). The agent flavor is a closed choice resolved
//! once at construction via [`parser_for`] — never string dispatch at call
//! sites.

pub mod claude;
pub mod codex;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::StreamEvent;

/// Which agent vocabulary a run's output speaks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentFlavor {
    #[default]
    Claude,
    Codex,
}

/// Translate one source line into normalized events.
///
/// Stateful by design: the codex vocabulary splits a final result across
/// `token_count` and `task_complete` lines, so the parser carries usage
/// between calls. Implementations never fail — anything unrecognized or
/// malformed is demoted to a `Raw` event.
pub trait LineParser: Send {
    fn parse_line(&mut self, line: &str) -> Vec<StreamEvent>;
}

/// Build the parser for a flavor. The only place the choice is made.
pub fn parser_for(flavor: AgentFlavor) -> Box<dyn LineParser> {
    match flavor {
        AgentFlavor::Claude => Box::new(claude::ClaudeParser::new()),
        AgentFlavor::Codex => Box::new(codex::CodexParser::new()),
    }
}

/// Why a stream ended, reported on the completion channel.
#[derive(Debug, thiserror::Error)]
pub enum StreamEnd {
    #[error("stream cancelled")]
    Cancelled,
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Consume a line-delimited stream to exhaustion, sending normalized events
/// on `events`.
///
/// Cancellation is checked before each line; once cancelled, remaining
/// buffered input is not flushed and the error is the completion signal.
/// Dropping of the receiving side ends the loop quietly.
pub async fn drive<R: AsyncRead + Unpin>(
    mut parser: Box<dyn LineParser>,
    reader: R,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<StreamEvent>,
) -> Result<(), StreamEnd> {
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamEnd::Cancelled),
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                if line.trim().is_empty() {
                    continue;
                }
                for event in parser.parse_line(&line) {
                    if events.send(event).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
