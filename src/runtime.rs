//! The narrow runtime abstraction between the manager and any concrete
//! agent CLI.
//!
//! The core never builds vendor-specific arguments: an [`AgentRuntime`]
//! turns a prompt into a running subprocess and exposes
//! terminate/suspend/continue primitives. [`CommandRuntime`] is the stock
//! implementation over a configured argv, with optional file-backed output
//! for crash survivability.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::follow::FollowReader;

pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Per-launch options passed through from the manager.
#[derive(Debug, Default, Clone)]
pub struct StartOptions {
    /// Skill this subprocess executes, when launched in skill mode.
    pub skill: Option<String>,
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// When set, child output is redirected to these files and read back
    /// through a follow reader, so a supervisor restart can re-tail them.
    pub stdout_log_path: Option<PathBuf>,
    pub stderr_log_path: Option<PathBuf>,
    /// The owning run's cancellation token; unblocks follow readers.
    pub cancel: CancellationToken,
}

/// How the subprocess exited.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub success: bool,
    /// Failure description when `success` is false.
    pub message: Option<String>,
}

/// A launched subprocess: pid, output streams, and an exit signal.
///
/// The manager takes the streams and the exit receiver; the pid stays valid
/// for signal-based control afterwards.
pub struct AgentProcess {
    pub pid: u32,
    pub stdout: Option<OutputReader>,
    pub stderr: Option<OutputReader>,
    pub exit: Option<oneshot::Receiver<ExitReport>>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Launch a subprocess for `prompt`. Must leave no state behind on
    /// failure.
    async fn start(&self, prompt: &str, opts: &StartOptions) -> Result<AgentProcess>;
    /// Request graceful termination.
    async fn stop(&self, pid: u32) -> Result<()>;
    /// Suspend execution, keeping the process attached.
    async fn pause(&self, pid: u32) -> Result<()>;
    /// Continue a suspended process.
    async fn resume(&self, pid: u32) -> Result<()>;
}

/// Check whether a process with the given PID is alive.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs error checking without sending a signal.
    unsafe { libc::kill(pid.cast_signed(), 0) == 0 }
}

fn signal(pid: u32, sig: libc::c_int) -> Result<()> {
    if pid == 0 {
        bail!("no process attached");
    }
    // SAFETY: plain kill(2); pid is validated nonzero above.
    let rc = unsafe { libc::kill(pid.cast_signed(), sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).with_context(|| format!("signal {sig} to pid {pid}"))
    }
}

/// Stock runtime: spawns a configured argv with the prompt as the final
/// argument. Which program and flags to use is configuration, not core
/// logic.
pub struct CommandRuntime {
    program: String,
    base_args: Vec<String>,
}

impl CommandRuntime {
    pub fn new(program: &str, base_args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            base_args,
        }
    }
}

#[async_trait]
impl AgentRuntime for CommandRuntime {
    async fn start(&self, prompt: &str, opts: &StartOptions) -> Result<AgentProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        cmd.args(&opts.extra_args);
        cmd.arg(prompt);
        if let Some(ref dir) = opts.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());

        // File-backed mode writes child output to disk and tails it back;
        // otherwise plain pipes.
        match opts.stdout_log_path {
            Some(ref path) => {
                cmd.stdout(Stdio::from(log_file(path)?));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }
        match opts.stderr_log_path {
            Some(ref path) => {
                cmd.stderr(Stdio::from(log_file(path)?));
            }
            None => {
                cmd.stderr(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        let pid = child.id().unwrap_or(0);

        let stdout: Option<OutputReader> = match opts.stdout_log_path {
            Some(ref path) => Some(Box::new(
                FollowReader::open(path, opts.cancel.clone())
                    .await
                    .with_context(|| format!("failed to follow {}", path.display()))?,
            )),
            None => child.stdout.take().map(|s| Box::new(s) as OutputReader),
        };
        let stderr: Option<OutputReader> = match opts.stderr_log_path {
            Some(ref path) => Some(Box::new(
                FollowReader::open(path, opts.cancel.clone())
                    .await
                    .with_context(|| format!("failed to follow {}", path.display()))?,
            )),
            None => child.stderr.take().map(|s| Box::new(s) as OutputReader),
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let report = match child.wait().await {
                Ok(status) if status.success() => ExitReport {
                    success: true,
                    message: None,
                },
                Ok(status) => ExitReport {
                    success: false,
                    message: Some(format!("exited with {status}")),
                },
                Err(e) => ExitReport {
                    success: false,
                    message: Some(format!("wait failed: {e}")),
                },
            };
            let _ = exit_tx.send(report);
        });

        Ok(AgentProcess {
            pid,
            stdout,
            stderr,
            exit: Some(exit_rx),
        })
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        signal(pid, libc::SIGTERM)
    }

    async fn pause(&self, pid: u32) -> Result<()> {
        signal(pid, libc::SIGSTOP)
    }

    async fn resume(&self, pid: u32) -> Result<()> {
        signal(pid, libc::SIGCONT)
    }
}

fn log_file(path: &std::path::Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}
