//! The authoritative in-memory run store.
//!
//! A map from run id to [`Run`] plus an explicit newest-first order list,
//! guarded by one `RwLock`. Reads hand out value copies. Every mutation
//! synchronously invokes registered subscriber callbacks and then makes a
//! non-blocking, coalescing push to a single-slot changed signal for
//! poll/select-style consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{Result, anyhow};
use tokio::sync::watch;

use crate::run::{Run, RunState};

type Subscriber = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    runs: HashMap<String, Run>,
    /// Run ids, newest first.
    order: Vec<String>,
}

pub struct RunStore {
    inner: RwLock<StoreInner>,
    subscribers: Mutex<Vec<Subscriber>>,
    changed_tx: watch::Sender<()>,
    /// Next id to assign. Only ever advances.
    next_id: AtomicU64,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(());
        Self {
            inner: RwLock::new(StoreInner::default()),
            subscribers: Mutex::new(Vec::new()),
            changed_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a run, assigning the next short identifier when none is given.
    /// Returns the id the run was stored under.
    pub fn add(&self, mut run: Run) -> String {
        if run.id.is_empty() {
            run.id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        } else if let Ok(n) = run.id.parse::<u64>() {
            // Keep the counter ahead of explicitly numbered runs.
            self.advance_counter(n + 1);
        }
        let id = run.id.clone();
        {
            let mut inner = self.write();
            inner.runs.insert(id.clone(), run);
            inner.order.retain(|existing| existing != &id);
            inner.order.insert(0, id.clone());
        }
        self.notify(&id);
        id
    }

    /// Apply a mutator under the write lock, only if the id exists. Never
    /// creates a run.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Run)) -> Result<()> {
        {
            let mut inner = self.write();
            let run = inner
                .runs
                .get_mut(id)
                .ok_or_else(|| anyhow!("unknown run: {id}"))?;
            f(run);
        }
        self.notify(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Run> {
        self.read().runs.get(id).cloned()
    }

    /// All runs, newest first, as copies.
    pub fn list(&self) -> Vec<Run> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.runs.get(id).cloned())
            .collect()
    }

    /// Delete a run. Only explicit removal deletes records; process exit
    /// never does. Returns the removed run, if any.
    pub fn remove(&self, id: &str) -> Option<Run> {
        let removed = {
            let mut inner = self.write();
            let removed = inner.runs.remove(id);
            if removed.is_some() {
                inner.order.retain(|existing| existing != id);
            }
            removed
        };
        if removed.is_some() {
            self.notify(id);
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.read()
            .runs
            .values()
            .filter(|r| matches!(r.state, RunState::Running | RunState::Paused))
            .count()
    }

    pub fn total_tokens(&self) -> u64 {
        self.read().runs.values().map(|r| r.total_tokens).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.read().runs.values().map(|r| r.cost_usd).sum()
    }

    /// Register a callback invoked synchronously with the mutated run's id
    /// on every add/update/remove.
    pub fn subscribe(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// A coalescing change signal: receivers see at most one pending
    /// notification no matter how many mutations occurred.
    pub fn changed(&self) -> watch::Receiver<()> {
        self.changed_tx.subscribe()
    }

    /// Ensure the next assigned id is at least `min`. Never regresses.
    pub fn advance_counter(&self, min: u64) {
        self.next_id.fetch_max(min, Ordering::SeqCst);
    }

    /// The id the next `add` without an id would assign.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    fn notify(&self, id: &str) {
        {
            let subs = self
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for sub in subs.iter() {
                sub(id);
            }
        }
        // send_replace never blocks; unobserved signals coalesce.
        self.changed_tx.send_replace(());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn add_assigns_sequential_ids() {
        let store = RunStore::new();
        let a = store.add(Run::new("", "first"));
        let b = store.add(Run::new("", "second"));
        assert_eq!(a, "1");
        assert_eq!(b, "2");
    }

    #[test]
    fn add_keeps_counter_ahead_of_explicit_ids() {
        let store = RunStore::new();
        store.add(Run::new("7", "explicit"));
        assert_eq!(store.add(Run::new("", "next")), "8");
    }

    #[test]
    fn list_is_newest_first() {
        let store = RunStore::new();
        store.add(Run::new("a", ""));
        store.add(Run::new("b", ""));
        store.add(Run::new("c", ""));
        let ids: Vec<_> = store.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn update_requires_existing_id() {
        let store = RunStore::new();
        store.add(Run::new("a", ""));
        assert!(store.update("a", |r| r.state = RunState::Running).is_ok());
        let err = store.update("ghost", |r| r.state = RunState::Running);
        assert!(err.unwrap_err().to_string().contains("ghost"));
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn get_returns_a_copy() {
        let store = RunStore::new();
        store.add(Run::new("a", "p"));
        let mut copy = store.get("a").unwrap();
        copy.state = RunState::Failed;
        assert_eq!(store.get("a").unwrap().state, RunState::Idle);
    }

    #[test]
    fn aggregates_scan_all_runs() {
        let store = RunStore::new();
        store.add(Run::new("a", ""));
        store.add(Run::new("b", ""));
        store
            .update("a", |r| {
                r.state = RunState::Running;
                r.total_tokens = 100;
                r.cost_usd = 0.5;
            })
            .unwrap();
        store
            .update("b", |r| {
                r.state = RunState::Paused;
                r.total_tokens = 50;
            })
            .unwrap();
        assert_eq!(store.active_count(), 2);
        assert_eq!(store.total_tokens(), 150);
        assert!((store.total_cost_usd() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn subscribers_fire_on_every_mutation() {
        let store = RunStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        store.add(Run::new("a", ""));
        store.update("a", |r| r.state = RunState::Running).unwrap();
        store.remove("a");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn changed_signal_coalesces() {
        let store = RunStore::new();
        let mut rx = store.changed();
        store.add(Run::new("a", ""));
        store.add(Run::new("b", ""));
        store.add(Run::new("c", ""));
        // Multiple mutations collapse into a single pending change.
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn advance_counter_never_regresses() {
        let store = RunStore::new();
        store.advance_counter(13);
        store.advance_counter(5);
        assert_eq!(store.peek_next_id(), 13);
        assert_eq!(store.add(Run::new("", "")), "13");
    }

    #[test]
    fn remove_deletes_and_reports() {
        let store = RunStore::new();
        store.add(Run::new("a", "p"));
        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert!(store.list().is_empty());
    }
}
