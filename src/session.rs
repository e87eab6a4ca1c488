//! Crash-safe persistence and rehydration of run state.
//!
//! Every run is mirrored to one versioned JSON file under the session
//! directory, written atomically (temp file + rename) and debounced per run.
//! On startup [`SessionStore::rehydrate`] reloads the files, re-seeds
//! buffers and cost ledgers, reattaches to subprocesses that survived the
//! restart, and marks the ones that didn't as Failed.
//!
//! Persistence is best-effort: a failed save is a `warn!`, never an error
//! surfaced to the mutation that triggered it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::run::{Run, RunState, SkillCost};
use crate::runtime::is_pid_alive;
use crate::store::RunStore;

/// Bumped whenever the file shape changes; older files are skipped on load.
pub const SESSION_VERSION: u32 = 2;

/// At most this many raw lines are persisted per run.
pub const LOG_TAIL_LIMIT: usize = 1000;

pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_secs(2);
pub const PID_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Error text applied to runs whose subprocess did not survive a restart.
const DEAD_PROCESS_ERROR: &str = "process not found after restart";

/// One run's persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub version: u32,
    pub run: Run,
    #[serde(default)]
    pub log_tail: Vec<String>,
    /// Set when the run's subprocess writes to log files, making its output
    /// recoverable after a supervisor restart.
    #[serde(default)]
    pub stdout_log_path: Option<PathBuf>,
    #[serde(default)]
    pub stderr_log_path: Option<PathBuf>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct SaveMark {
    last_saved: Instant,
    last_state: RunState,
}

/// Reads and writes the per-project session directory.
pub struct SessionStore {
    dir: PathBuf,
    debounce: Duration,
    marks: Mutex<HashMap<String, SaveMark>>,
    /// Log-file locations per run, carried into every save so a reconnect
    /// after the next restart can find them.
    log_paths: Mutex<HashMap<String, (Option<PathBuf>, Option<PathBuf>)>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            debounce: DEFAULT_SAVE_DEBOUNCE,
            marks: Mutex::new(HashMap::new()),
            log_paths: Mutex::new(HashMap::new()),
        }
    }

    /// Session directory for one project under a shared state directory.
    pub fn for_project(state_dir: &Path, project_root: &Path) -> Self {
        Self::new(state_dir.join(project_hash(project_root)))
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record where a run's subprocess logs live; included in every
    /// subsequent save of that run.
    pub fn set_log_paths(&self, id: &str, stdout: Option<PathBuf>, stderr: Option<PathBuf>) {
        lock(&self.log_paths).insert(id.to_string(), (stdout, stderr));
    }

    /// Write one run's session file atomically: serialize to a temp file in
    /// the same directory, then rename over the target.
    pub fn save(&self, run: &Run, log_tail: &[String]) -> Result<()> {
        if run.id.is_empty() {
            bail!("refusing to save a run without an id");
        }
        if run.id.contains(['/', '\\']) {
            bail!("run id {:?} is not a valid file stem", run.id);
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create session dir {}", self.dir.display()))?;

        let start = log_tail.len().saturating_sub(LOG_TAIL_LIMIT);
        let (stdout_log_path, stderr_log_path) = lock(&self.log_paths)
            .get(&run.id)
            .cloned()
            .unwrap_or_default();
        let file = SessionFile {
            version: SESSION_VERSION,
            run: run.clone(),
            log_tail: log_tail[start..].to_vec(),
            stdout_log_path,
            stderr_log_path,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&file).context("failed to serialize session")?;

        let target = self.path_for(&run.id);
        let temp = self
            .dir
            .join(format!(".{}.{:08x}.tmp", run.id, rand::random::<u32>()));
        std::fs::write(&temp, json)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        std::fs::rename(&temp, &target)
            .with_context(|| format!("failed to move session into place at {}", target.display()))
    }

    /// Load every valid session file, oldest run first. Wrong version,
    /// missing id, and parse failures are skipped with a warning.
    pub fn load_all(&self) -> Vec<SessionFile> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("skipping unreadable session file {}: {e}", path.display());
                    continue;
                }
            };
            let file: SessionFile = match serde_json::from_str(&content) {
                Ok(file) => file,
                Err(e) => {
                    warn!("skipping corrupt session file {}: {e}", path.display());
                    continue;
                }
            };
            if file.version != SESSION_VERSION {
                warn!(
                    "skipping session file {} with version {} (want {SESSION_VERSION})",
                    path.display(),
                    file.version
                );
                continue;
            }
            if file.run.id.is_empty() {
                warn!("skipping session file {} with no run id", path.display());
                continue;
            }
            files.push(file);
        }
        files.sort_by_key(|f| f.run.created_at);
        files
    }

    /// Remove a run's session file and all bookkeeping for it.
    pub fn delete(&self, id: &str) {
        lock(&self.marks).remove(id);
        lock(&self.log_paths).remove(id);
        if let Err(e) = std::fs::remove_file(self.path_for(id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run = id, "failed to delete session file: {e}");
            }
        }
    }

    /// Subscribe to store mutations, saving each changed run. State changes
    /// and terminal entries save immediately; everything else is debounced
    /// to once per interval per run. Removed runs get their file deleted.
    /// Skill-scoped sub-ids (containing `:`) never get their own file.
    pub fn bind(
        self: &Arc<Self>,
        store: &Arc<RunStore>,
        tail: impl Fn(&str) -> Vec<String> + Send + Sync + 'static,
    ) {
        let sessions = Arc::clone(self);
        let runs = Arc::clone(store);
        store.subscribe(move |id| {
            if id.contains(':') {
                return;
            }
            let Some(run) = runs.get(id) else {
                sessions.delete(id);
                return;
            };
            if !sessions.should_save(&run) {
                return;
            }
            if let Err(e) = sessions.save(&run, &tail(id)) {
                warn!(run = id, "session save failed: {e}");
            }
        });
    }

    fn should_save(&self, run: &Run) -> bool {
        let mut marks = lock(&self.marks);
        let now = Instant::now();
        let save = match marks.get(&run.id) {
            Some(mark) => {
                mark.last_state != run.state
                    || run.state.is_terminal()
                    || now.duration_since(mark.last_saved) >= self.debounce
            }
            None => true,
        };
        if save {
            marks.insert(
                run.id.clone(),
                SaveMark {
                    last_saved: now,
                    last_state: run.state,
                },
            );
        }
        save
    }

    /// Restore all saved sessions into the store. Buffers are re-seeded and
    /// skill costs replayed (in original order) for every run; non-terminal
    /// runs are reconnected, watched, or marked Failed depending on whether
    /// their subprocess survived. The store's id counter ends up past every
    /// restored numeric id.
    pub fn rehydrate(&self, store: &Arc<RunStore>, hooks: &RehydrateHooks) -> RehydrateReport {
        let mut report = RehydrateReport::default();
        for file in self.load_all() {
            let mut run = file.run.clone();
            let id = run.id.clone();
            report.restored += 1;

            self.set_log_paths(
                &id,
                file.stdout_log_path.clone(),
                file.stderr_log_path.clone(),
            );
            (hooks.inject)(&id, &file.log_tail);
            for cost in &run.skill_costs {
                (hooks.record_cost)(&id, cost);
            }

            if run.state.is_terminal() {
                store.add(run);
            } else if is_pid_alive(run.pid) {
                let pid = run.pid;
                store.add(run);
                if file.stdout_log_path.is_some() {
                    match (hooks.reconnect)(&file) {
                        Ok(()) => report.reconnected.push(id),
                        Err(e) => {
                            warn!(run = %id, "reconnect failed, watching pid instead: {e}");
                            report.watch.push((id, pid));
                        }
                    }
                } else {
                    report.watch.push((id, pid));
                }
            } else {
                run.state = RunState::Failed;
                run.error = DEAD_PROCESS_ERROR.to_string();
                run.pid = 0;
                run.completed_at = Some(Utc::now());
                store.add(run);
                report.failed.push(id);
            }
        }
        report
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

/// Host-supplied callbacks that break the persistence→manager dependency.
pub struct RehydrateHooks {
    /// Seed a run's buffers from its saved raw lines.
    pub inject: Box<dyn Fn(&str, &[String]) + Send + Sync>,
    /// Re-record one saved skill cost into the session ledger.
    pub record_cost: Box<dyn Fn(&str, &SkillCost) + Send + Sync>,
    /// Reattach to a still-running subprocess via its log files.
    pub reconnect: Box<dyn Fn(&SessionFile) -> Result<()> + Send + Sync>,
}

/// What rehydration did, for the embedding host's startup report.
#[derive(Debug, Default)]
pub struct RehydrateReport {
    /// Session files restored into the store.
    pub restored: usize,
    /// Runs reattached to a surviving subprocess.
    pub reconnected: Vec<String>,
    /// Runs whose subprocess survives but has no recoverable output; watch
    /// these with [`watch_pids`].
    pub watch: Vec<(String, u32)>,
    /// Runs whose subprocess died while the supervisor was away.
    pub failed: Vec<String>,
}

/// Poll a set of orphaned subprocesses, marking each run Failed when its
/// process disappears. Returns when the set is empty or on cancellation.
pub async fn watch_pids(
    store: Arc<RunStore>,
    mut watched: Vec<(String, u32)>,
    interval: Duration,
    cancel: CancellationToken,
) {
    while !watched.is_empty() {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        watched.retain(|(id, pid)| {
            if is_pid_alive(*pid) {
                return true;
            }
            let _ = store.update(id, |r| {
                r.state = RunState::Failed;
                r.error = DEAD_PROCESS_ERROR.to_string();
                r.pid = 0;
                r.completed_at = Some(Utc::now());
            });
            false
        });
    }
}

/// First 8 hex characters of the SHA-256 of a project path. Keys the
/// per-project session directory under a shared state directory.
pub fn project_hash(path: &Path) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path())
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        let mut run = Run::new("7", "fix the bug");
        run.state = RunState::Completed;
        run.total_tokens = 150;

        sessions
            .save(&run, &["[10:00:00] hello".to_string()])
            .unwrap();
        let loaded = sessions.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run.id, "7");
        assert_eq!(loaded[0].run.total_tokens, 150);
        assert_eq!(loaded[0].log_tail, vec!["[10:00:00] hello"]);
        assert_eq!(loaded[0].version, SESSION_VERSION);
    }

    #[test]
    fn save_truncates_tail_to_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        let lines: Vec<String> = (0..LOG_TAIL_LIMIT + 50).map(|i| i.to_string()).collect();
        sessions.save(&Run::new("1", "p"), &lines).unwrap();

        let loaded = sessions.load_all();
        assert_eq!(loaded[0].log_tail.len(), LOG_TAIL_LIMIT);
        // Oldest lines fall off the front.
        assert_eq!(loaded[0].log_tail[0], "50");
    }

    #[test]
    fn save_refuses_unidentified_runs() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        assert!(sessions.save(&Run::new("", "p"), &[]).is_err());
        assert!(sessions.save(&Run::new("../sneaky", "p"), &[]).is_err());
    }

    #[test]
    fn load_skips_invalid_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        sessions.save(&Run::new("1", "good"), &[]).unwrap();

        std::fs::write(dir.path().join("corrupt.json"), "not json at all").unwrap();
        let mut old = SessionFile {
            version: SESSION_VERSION - 1,
            run: Run::new("2", "old format"),
            log_tail: Vec::new(),
            stdout_log_path: None,
            stderr_log_path: None,
            saved_at: Utc::now(),
        };
        std::fs::write(
            dir.path().join("2.json"),
            serde_json::to_string(&old).unwrap(),
        )
        .unwrap();
        old.version = SESSION_VERSION;
        old.run.id = String::new();
        std::fs::write(
            dir.path().join("anon.json"),
            serde_json::to_string(&old).unwrap(),
        )
        .unwrap();

        let loaded = sessions.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run.id, "1");
    }

    #[test]
    fn load_sorts_by_created_at() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        let mut newer = Run::new("b", "");
        let mut older = Run::new("a", "");
        older.created_at = newer.created_at - chrono::Duration::hours(1);
        newer.created_at += chrono::Duration::hours(1);
        sessions.save(&newer, &[]).unwrap();
        sessions.save(&older, &[]).unwrap();

        let ids: Vec<_> = sessions.load_all().into_iter().map(|f| f.run.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        sessions.save(&Run::new("1", "p"), &[]).unwrap();
        sessions.delete("1");
        assert!(sessions.load_all().is_empty());
        // Deleting again is a quiet no-op.
        sessions.delete("1");
    }

    #[test]
    fn saved_log_paths_survive_saves() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir);
        sessions.set_log_paths("1", Some(PathBuf::from("/tmp/1.out")), None);
        sessions.save(&Run::new("1", "p"), &[]).unwrap();
        let loaded = sessions.load_all();
        assert_eq!(
            loaded[0].stdout_log_path.as_deref(),
            Some(Path::new("/tmp/1.out"))
        );
        assert!(loaded[0].stderr_log_path.is_none());
    }

    #[test]
    fn debounce_suppresses_rapid_resaves() {
        let dir = tempfile::TempDir::new().unwrap();
        let sessions = store_in(&dir).with_debounce(Duration::from_secs(60));
        let mut run = Run::new("1", "p");
        run.state = RunState::Running;

        assert!(sessions.should_save(&run), "first save always goes through");
        run.total_tokens = 100;
        assert!(!sessions.should_save(&run), "same state, inside interval");
        run.state = RunState::Paused;
        assert!(sessions.should_save(&run), "state change saves immediately");
        run.state = RunState::Completed;
        assert!(sessions.should_save(&run), "terminal entry saves");
        assert!(sessions.should_save(&run), "terminal resaves are never debounced");
    }

    #[test]
    fn project_hash_is_short_and_stable() {
        let a = project_hash(Path::new("/home/dev/project"));
        let b = project_hash(Path::new("/home/dev/project"));
        let c = project_hash(Path::new("/home/dev/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
