//! The process manager: subprocess lifecycle, per-run consumption tasks,
//! buffer writes, usage accounting, and exit handling.
//!
//! Each active run owns one stdout-parser task, one stderr reader task, and
//! an exit waiter, all bound to the run's cancellation token. Lock sections
//! are short map operations and are never held across I/O.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chrono::{Local, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{EntryBuffer, LineBuffer};
use crate::cost::{CostTracker, LimitChecker, is_rate_limit};
use crate::event::{
    self, COMPLETED_MESSAGE, ERROR_PREFIX, LogEntry, LogKind, RATE_LIMIT_PREFIX, StreamEvent,
};
use crate::follow::FollowReader;
use crate::protocol::{AgentFlavor, StreamEnd, drive, parser_for};
use crate::run::{RunState, SkillCost};
use crate::runtime::{
    AgentProcess, AgentRuntime, ExitReport, OutputReader, StartOptions, is_pid_alive,
};
use crate::sink::{CommandScreen, RunSink};
use crate::store::RunStore;

pub const DEFAULT_LINE_CAPACITY: usize = 10_000;
pub const DEFAULT_ENTRY_CAPACITY: usize = 5_000;

/// After the exit signal, how long the parser may keep draining buffered
/// output (or a file tail) before its token is cancelled.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How often a reattached run's pid is checked for exit.
const ATTACH_PID_POLL: Duration = Duration::from_secs(1);

/// The raw/structured buffer pair for one run.
#[derive(Clone)]
pub struct RunBuffers {
    pub lines: Arc<LineBuffer>,
    pub entries: Arc<EntryBuffer>,
}

impl RunBuffers {
    fn new(line_capacity: usize, entry_capacity: usize) -> Self {
        Self {
            lines: Arc::new(LineBuffer::new(line_capacity)),
            entries: Arc::new(EntryBuffer::new(entry_capacity)),
        }
    }
}

/// Outcome published on a skill call's result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillOutcome {
    Completed { result: String },
    Failed { error: String },
    /// The host is shutting down with the subprocess left running for later
    /// reattachment. Distinct from both completion and failure.
    Disconnected,
}

enum RunMode {
    /// Drives the run to Completed/Failed on exit.
    Full,
    /// Never drives terminal state; an external orchestrator owns that
    /// transition. Publishes the outcome on a per-call channel.
    Skill {
        result_tx: oneshot::Sender<SkillOutcome>,
    },
}

struct ActiveRun {
    pid: u32,
    cancel: CancellationToken,
}

/// Tunables for the manager, typically sourced from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub flavor: AgentFlavor,
    pub max_concurrent: usize,
    pub limits: LimitChecker,
    pub line_capacity: usize,
    pub entry_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            flavor: AgentFlavor::default(),
            max_concurrent: 3,
            limits: LimitChecker::default(),
            line_capacity: DEFAULT_LINE_CAPACITY,
            entry_capacity: DEFAULT_ENTRY_CAPACITY,
        }
    }
}

pub struct Manager {
    store: Arc<RunStore>,
    costs: Arc<CostTracker>,
    runtime: Arc<dyn AgentRuntime>,
    config: ManagerConfig,
    buffers: Mutex<HashMap<String, RunBuffers>>,
    active: Mutex<HashMap<String, ActiveRun>>,
    sink: Mutex<Option<Arc<dyn RunSink>>>,
    screen: Mutex<Option<Arc<dyn CommandScreen>>>,
    /// Once set, subsequent exits preserve PID and Running state so the
    /// processes can be reattached after a host restart.
    disconnecting: AtomicBool,
}

impl Manager {
    pub fn new(
        store: Arc<RunStore>,
        costs: Arc<CostTracker>,
        runtime: Arc<dyn AgentRuntime>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            costs,
            runtime,
            config,
            buffers: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            screen: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
        })
    }

    /// Register the UI notification sink.
    pub fn set_sink(&self, sink: Arc<dyn RunSink>) {
        *lock(&self.sink) = Some(sink);
    }

    /// Register the external safety-pattern matcher.
    pub fn set_screen(&self, screen: Arc<dyn CommandScreen>) {
        *lock(&self.screen) = Some(screen);
    }

    /// Flip the manager into disconnect mode: exits observed from now on
    /// leave runs Running with their PID attached.
    pub fn set_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the run's subprocess and drive it to a terminal state on exit.
    pub async fn start_run(self: &Arc<Self>, id: &str, opts: StartOptions) -> Result<()> {
        let run = self
            .store
            .get(id)
            .ok_or_else(|| anyhow!("unknown run: {id}"))?;
        let (proc, cancel) = self.launch(id, &run.prompt, opts).await?;
        let skill = run.skill.clone();
        let pid = proc.pid;
        self.store.update(id, |r| {
            r.state = RunState::Running;
            r.pid = pid;
            r.started_at = Some(Utc::now());
            r.error.clear();
        })?;
        self.spawn_consumer(id, &skill, RunMode::Full, proc, cancel);
        Ok(())
    }

    /// Start a subprocess for one skill of a run. Terminal state is owned
    /// by the caller; the returned channel yields the skill's outcome.
    pub async fn start_skill(
        self: &Arc<Self>,
        id: &str,
        skill: &str,
        prompt: &str,
        mut opts: StartOptions,
    ) -> Result<oneshot::Receiver<SkillOutcome>> {
        if self.store.get(id).is_none() {
            bail!("unknown run: {id}");
        }
        opts.skill = Some(skill.to_string());
        let (proc, cancel) = self.launch(id, prompt, opts).await?;
        let pid = proc.pid;
        let skill_name = skill.to_string();
        self.store.update(id, |r| {
            r.pid = pid;
            r.skill = skill_name;
        })?;
        let (result_tx, result_rx) = oneshot::channel();
        self.spawn_consumer(id, skill, RunMode::Skill { result_tx }, proc, cancel);
        Ok(result_rx)
    }

    /// Reserve an active slot, then launch. The reservation makes the
    /// concurrency check race-free without holding a lock across the spawn;
    /// on launch failure no state is left behind.
    async fn launch(
        &self,
        id: &str,
        prompt: &str,
        mut opts: StartOptions,
    ) -> Result<(AgentProcess, CancellationToken)> {
        let cancel = CancellationToken::new();
        {
            let mut active = lock(&self.active);
            if active.contains_key(id) {
                bail!("run {id} already has an active process");
            }
            if active.len() >= self.config.max_concurrent {
                bail!(
                    "concurrency limit reached ({} active): not starting run {id}",
                    self.config.max_concurrent
                );
            }
            active.insert(
                id.to_string(),
                ActiveRun {
                    pid: 0,
                    cancel: cancel.clone(),
                },
            );
        }

        opts.cancel = cancel.clone();
        let proc = match self.runtime.start(prompt, &opts).await {
            Ok(proc) => proc,
            Err(e) => {
                lock(&self.active).remove(id);
                return Err(e);
            }
        };

        if let Some(entry) = lock(&self.active).get_mut(id) {
            entry.pid = proc.pid;
        }
        // Fresh buffer pair per process start; injection replaces it
        // wholesale during rehydration instead.
        lock(&self.buffers).insert(
            id.to_string(),
            RunBuffers::new(self.config.line_capacity, self.config.entry_capacity),
        );
        Ok((proc, cancel))
    }

    /// Reattach to a subprocess that survived a supervisor restart, tailing
    /// its log files from their current end. Exit is detected by polling the
    /// pid; the exit status itself is unobservable across a restart, so a
    /// reattached exit reports success.
    pub fn attach(
        self: &Arc<Self>,
        id: &str,
        pid: u32,
        stdout_log: &Path,
        stderr_log: Option<&Path>,
    ) -> Result<()> {
        let run = self
            .store
            .get(id)
            .ok_or_else(|| anyhow!("unknown run: {id}"))?;
        if !is_pid_alive(pid) {
            bail!("pid {pid} is not alive");
        }
        let cancel = CancellationToken::new();
        {
            let mut active = lock(&self.active);
            if active.contains_key(id) {
                bail!("run {id} already has an active process");
            }
            // Reattachment is exempt from the concurrency ceiling: the
            // processes already exist.
            active.insert(
                id.to_string(),
                ActiveRun {
                    pid,
                    cancel: cancel.clone(),
                },
            );
        }
        // Rehydration seeds buffers before reattaching; keep them.
        if self.buffers(id).is_none() {
            lock(&self.buffers).insert(
                id.to_string(),
                RunBuffers::new(self.config.line_capacity, self.config.entry_capacity),
            );
        }
        self.store.update(id, |r| {
            r.state = RunState::Running;
            r.pid = pid;
        })?;

        let manager = self.clone();
        let id = id.to_string();
        let skill = run.skill.clone();
        let stdout_log = stdout_log.to_path_buf();
        let stderr_log = stderr_log.map(Path::to_path_buf);
        tokio::spawn(async move {
            let stdout = match FollowReader::open_at_end(&stdout_log, cancel.clone()).await {
                Ok(reader) => Box::new(reader) as OutputReader,
                Err(e) => {
                    warn!(run = %id, "failed to reopen {}: {e}", stdout_log.display());
                    lock(&manager.active).remove(&id);
                    let _ = manager.store.update(&id, |r| {
                        r.state = RunState::Failed;
                        r.error = format!("could not reattach: {e}");
                        r.pid = 0;
                        r.completed_at = Some(Utc::now());
                    });
                    return;
                }
            };
            let mut stderr = None;
            if let Some(path) = &stderr_log {
                match FollowReader::open_at_end(path, cancel.clone()).await {
                    Ok(reader) => stderr = Some(Box::new(reader) as OutputReader),
                    Err(e) => warn!(run = %id, "failed to reopen {}: {e}", path.display()),
                }
            }

            let (exit_tx, exit_rx) = oneshot::channel();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(ATTACH_PID_POLL) => {}
                        }
                        if !is_pid_alive(pid) {
                            break;
                        }
                    }
                    let _ = exit_tx.send(ExitReport {
                        success: true,
                        message: None,
                    });
                });
            }

            let proc = AgentProcess {
                pid,
                stdout: Some(stdout),
                stderr,
                exit: Some(exit_rx),
            };
            manager.consume(&id, &skill, RunMode::Full, proc, cancel).await;
        });
        Ok(())
    }

    /// Request graceful termination of the run's subprocess.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let pid = self.active_pid(id)?;
        self.runtime.stop(pid).await
    }

    /// Suspend the run's subprocess and mark the run Paused.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let pid = self.active_pid(id)?;
        self.runtime.pause(pid).await?;
        self.store.update(id, |r| r.state = RunState::Paused)
    }

    /// Continue a paused run.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let pid = self.active_pid(id)?;
        self.runtime.resume(pid).await?;
        self.store.update(id, |r| r.state = RunState::Running)
    }

    /// Signal the OS process directly (when attached), then cancel the
    /// run's context, unblocking stream reads and follow polls.
    pub fn kill(&self, id: &str) -> Result<()> {
        let (pid, cancel) = {
            let active = lock(&self.active);
            let entry = active.get(id).ok_or_else(|| anyhow!("unknown run: {id}"))?;
            (entry.pid, entry.cancel.clone())
        };
        if pid > 0 {
            // SAFETY: plain kill(2) on a pid we spawned.
            unsafe {
                libc::kill(pid.cast_signed(), libc::SIGKILL);
            }
        }
        cancel.cancel();
        Ok(())
    }

    /// Discard a run entirely: active process, buffers, ledger, record.
    pub fn remove_run(&self, id: &str) {
        if let Ok(()) = self.kill(id) {
            lock(&self.active).remove(id);
        }
        lock(&self.buffers).remove(id);
        self.costs.remove(id);
        self.store.remove(id);
    }

    // ── Buffer access ───────────────────────────────────────────────────

    pub fn buffers(&self, id: &str) -> Option<RunBuffers> {
        lock(&self.buffers).get(id).cloned()
    }

    /// Last `n` raw lines for a run, if it has buffers.
    pub fn tail_lines(&self, id: &str, n: usize) -> Option<Vec<String>> {
        self.buffers(id).map(|b| b.lines.tail(n))
    }

    /// Seed fresh buffers from saved raw lines, reverse-parsing each into a
    /// structured entry. Replaces any existing pair wholesale.
    pub fn inject_buffers(&self, id: &str, lines: &[String]) {
        let bufs = RunBuffers::new(self.config.line_capacity, self.config.entry_capacity);
        for line in lines {
            bufs.lines.push(line.clone());
            if let Some(entry) = event::parse_line(line) {
                bufs.entries.push(entry);
            }
        }
        lock(&self.buffers).insert(id.to_string(), bufs);
    }

    pub fn remove_buffers(&self, id: &str) {
        lock(&self.buffers).remove(id);
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    fn active_pid(&self, id: &str) -> Result<u32> {
        lock(&self.active)
            .get(id)
            .map(|entry| entry.pid)
            .ok_or_else(|| anyhow!("unknown run: {id}"))
    }

    // ── Consumption ─────────────────────────────────────────────────────

    fn spawn_consumer(
        self: &Arc<Self>,
        id: &str,
        skill: &str,
        mode: RunMode,
        proc: AgentProcess,
        cancel: CancellationToken,
    ) {
        let manager = self.clone();
        let id = id.to_string();
        let skill = skill.to_string();
        tokio::spawn(async move {
            manager.consume(&id, &skill, mode, proc, cancel).await;
        });
    }

    /// Drain one subprocess to completion: stdout through the flavor
    /// parser, stderr as raw lines, then exit handling.
    async fn consume(
        self: Arc<Self>,
        id: &str,
        skill: &str,
        mode: RunMode,
        mut proc: AgentProcess,
        cancel: CancellationToken,
    ) {
        let Some(bufs) = self.buffers(id) else {
            warn!(run = id, "no buffers allocated; dropping output");
            return;
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let parser_task = proc.stdout.take().map(|stdout| {
            let parser = parser_for(self.config.flavor);
            let cancel = cancel.clone();
            tokio::spawn(async move { drive(parser, stdout, cancel, event_tx).await })
        });

        let stderr_task = proc.stderr.take().map(|stderr| {
            let manager = self.clone();
            let id = id.to_string();
            let skill = skill.to_string();
            let bufs = bufs.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // stderr is never structured: every line lands verbatim.
                let result = drive(
                    Box::new(RawLines),
                    stderr,
                    cancel,
                    manager.raw_channel(&id, &skill, &bufs),
                );
                result.await
            })
        });

        let mut last_result = String::new();
        let mut exit_rx = proc.exit.take();
        let mut exit_report: Option<ExitReport> = None;

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => {
                        if let StreamEvent::Result { text, .. } = &event {
                            last_result.clone_from(text);
                        }
                        self.handle_event(id, skill, &event, &bufs).await;
                    }
                    None => break,
                },
                report = recv_exit(&mut exit_rx) => {
                    exit_rx = None;
                    exit_report = Some(report);
                    // Let the parser drain buffered output or the log-file
                    // tail, then unblock it.
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(EXIT_DRAIN_GRACE).await;
                        cancel.cancel();
                    });
                }
            }
        }

        if let Some(task) = parser_task {
            match task.await {
                Ok(Err(StreamEnd::Cancelled)) => debug!(run = id, "stdout stream cancelled"),
                Ok(Err(e)) => warn!(run = id, "stdout stream failed: {e}"),
                _ => {}
            }
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let report = match exit_rx {
            Some(rx) => rx.await.ok(),
            None => exit_report,
        }
        .unwrap_or(ExitReport {
            success: false,
            message: Some("exit signal lost".to_string()),
        });

        self.finish(id, skill, mode, &last_result, report, &bufs);
    }

    /// Channel adapter: raw events from the stderr reader feed the buffers
    /// directly.
    fn raw_channel(
        self: &Arc<Self>,
        id: &str,
        skill: &str,
        bufs: &RunBuffers,
    ) -> mpsc::UnboundedSender<StreamEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = self.clone();
        let id = id.to_string();
        let skill = skill.to_string();
        let bufs = bufs.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.handle_event(&id, &skill, &event, &bufs).await;
            }
        });
        tx
    }

    /// Project one event into the run's buffers, account usage, and notify
    /// observers.
    async fn handle_event(&self, id: &str, skill: &str, event: &StreamEvent, bufs: &RunBuffers) {
        let now = Local::now().time();

        // Rate-limit errors are expected backoff, not failure: raw line
        // only, structured view untouched.
        let rate_limited = matches!(event, StreamEvent::Error(text) if is_rate_limit(text));

        if let StreamEvent::ToolUse { name, input } = event {
            self.screen_command(id, skill, name, input, bufs);
        }

        let message = match event {
            StreamEvent::Error(text) if rate_limited => {
                format!("{RATE_LIMIT_PREFIX}{text}")
            }
            other => event::event_message(other),
        };
        bufs.lines.push(event::format_line(now, skill, &message));

        if rate_limited {
            warn!(run = id, "{message}");
        } else if let StreamEvent::ToolResult(text) = event {
            // Fold a tool's output into its pending invocation entry.
            let open_tool = bufs
                .entries
                .tail(1)
                .first()
                .is_some_and(|e| e.kind == LogKind::ToolUse && !e.complete);
            if open_tool {
                let text = text.clone();
                bufs.entries.update_last(move |entry| {
                    entry.detail = Some(text);
                    entry.complete = true;
                });
            } else {
                bufs.entries.push(LogEntry::from_event(now, skill, event));
            }
        } else {
            bufs.entries.push(LogEntry::from_event(now, skill, event));
        }

        if let StreamEvent::Result {
            usage: Some(usage), ..
        } = event
        {
            self.account_usage(id, skill, usage).await;
        }

        self.notify_line(id);
    }

    /// Advisory safety check on shell-tool invocations.
    fn screen_command(&self, id: &str, skill: &str, name: &str, input: &Value, bufs: &RunBuffers) {
        let screen = lock(&self.screen).clone();
        let Some(screen) = screen else { return };
        if !name.eq_ignore_ascii_case("bash") && !name.eq_ignore_ascii_case("shell") {
            return;
        }
        let Some(command) = input.get("command").and_then(Value::as_str) else {
            return;
        };
        if screen.is_flagged(command) {
            warn!(run = id, "flagged command: {command}");
            let now = Local::now().time();
            let warning = format!("WARNING: command matched a safety pattern: {command}");
            bufs.lines.push(event::format_line(now, skill, &warning));
            bufs.entries
                .push(LogEntry::from_event(now, skill, &StreamEvent::Text(warning)));
        }
    }

    /// Apply one Result-with-usage event: run counters, ledgers, threshold
    /// check. Applies exactly once per event, in arrival order.
    async fn account_usage(&self, id: &str, skill: &str, usage: &crate::event::UsageData) {
        if self
            .store
            .update(id, |r| r.record_usage(skill, usage))
            .is_err()
        {
            warn!(run = id, "usage for unknown run dropped");
            return;
        }
        self.costs.record(id, SkillCost::new(skill, usage));

        let Some(run) = self.store.get(id) else { return };
        if let Some(breach) = self.config.limits.check_run(run.total_tokens, run.cost_usd) {
            warn!(run = id, "limit breached: {breach}; pausing");
            if let Err(e) = self.pause(id).await {
                debug!(run = id, "pause after breach failed: {e}");
            }
            self.notify_threshold(id, &breach.to_string());
        }
    }

    /// Exit handling for both modes, honoring disconnect mode.
    fn finish(
        &self,
        id: &str,
        skill: &str,
        mode: RunMode,
        last_result: &str,
        report: ExitReport,
        bufs: &RunBuffers,
    ) {
        lock(&self.active).remove(id);

        if self.disconnecting.load(Ordering::SeqCst) {
            // Host shutdown: leave Running state and PID for reattachment.
            if let RunMode::Skill { result_tx } = mode {
                let _ = result_tx.send(SkillOutcome::Disconnected);
            }
            return;
        }

        let now = Local::now().time();
        match mode {
            RunMode::Full => {
                let error = report.message.clone().unwrap_or_default();
                let exit_line = if report.success {
                    COMPLETED_MESSAGE.to_string()
                } else {
                    format!("{ERROR_PREFIX}{error}")
                };
                bufs.lines.push(event::format_line(now, skill, &exit_line));
                if let Some(entry) = event::parse_line(&event::format_line(now, skill, &exit_line))
                {
                    bufs.entries.push(entry);
                }
                let state = if report.success {
                    RunState::Completed
                } else {
                    RunState::Failed
                };
                let _ = self.store.update(id, |r| {
                    r.state = state;
                    r.error = error.clone();
                    r.pid = 0;
                    r.completed_at = Some(Utc::now());
                });
                self.notify_line(id);
            }
            RunMode::Skill { result_tx } => {
                let _ = self.store.update(id, |r| r.pid = 0);
                let outcome = if report.success {
                    SkillOutcome::Completed {
                        result: last_result.to_string(),
                    }
                } else {
                    SkillOutcome::Failed {
                        error: report.message.unwrap_or_default(),
                    }
                };
                let _ = result_tx.send(outcome);
            }
        }
    }

    // ── Notifications ───────────────────────────────────────────────────

    fn notify_line(&self, id: &str) {
        if let Some(sink) = lock(&self.sink).clone() {
            sink.line_appended(id);
        }
    }

    fn notify_threshold(&self, id: &str, reason: &str) {
        if let Some(sink) = lock(&self.sink).clone() {
            sink.threshold_breached(id, reason);
        }
    }
}

/// Parser that treats every line as raw text (stderr path).
struct RawLines;

impl crate::protocol::LineParser for RawLines {
    fn parse_line(&mut self, line: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::Raw(line.to_string())]
    }
}

async fn recv_exit(rx: &mut Option<oneshot::Receiver<ExitReport>>) -> ExitReport {
    match rx {
        Some(rx) => rx.await.unwrap_or(ExitReport {
            success: false,
            message: Some("exit signal lost".to_string()),
        }),
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
