//! Observer seams between the manager and its host.
//!
//! Both are registered explicitly on the manager (setter under its own
//! lock) — never reached through a global.

/// UI notification surface: best-effort wake-up signals. The actual data
/// lives in the run's buffers, not in the signal.
pub trait RunSink: Send + Sync {
    /// A new line was appended to the run's buffers.
    fn line_appended(&self, run_id: &str);
    /// A cost/token ceiling was crossed; the run has been paused.
    fn threshold_breached(&self, run_id: &str, reason: &str);
}

/// External safety-pattern matcher, consumed as a yes/no check on shell
/// commands. A match produces an advisory warning line only; blocking (if
/// any) happens outside this core.
pub trait CommandScreen: Send + Sync {
    fn is_flagged(&self, command: &str) -> bool;
}
