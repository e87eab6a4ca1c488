//! Cost accounting: a per-run ledger with session-wide aggregates, plus the
//! stateless threshold and rate-limit-text classifiers.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::run::SkillCost;

/// Phrases that mark a provider error as a backoff signal rather than a
/// genuine failure. Fixed data: expanding it changes observable error
/// classification.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "too many requests",
    "overloaded",
];

/// Case-insensitive substring check against the fixed rate-limit phrase set.
pub fn is_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Default)]
struct TrackerState {
    ledgers: HashMap<String, Vec<SkillCost>>,
    total_tokens: u64,
    total_cost_usd: f64,
}

/// Append-only per-run cost ledger with O(1)-maintained session totals.
///
/// One lock guards the ledger map and the aggregates; aggregates are updated
/// incrementally on [`record`](CostTracker::record), never recomputed.
#[derive(Debug, Default)]
pub struct CostTracker {
    state: Mutex<TrackerState>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run_id: &str, cost: SkillCost) {
        let mut state = self.lock();
        state.total_tokens += cost.total_tokens;
        state.total_cost_usd += cost.cost_usd;
        state
            .ledgers
            .entry(run_id.to_string())
            .or_default()
            .push(cost);
    }

    /// Defensive copy of one run's ledger, in recording order.
    pub fn run_costs(&self, run_id: &str) -> Option<Vec<SkillCost>> {
        self.lock().ledgers.get(run_id).cloned()
    }

    /// Summed tokens and dollars for one run; zeros for unknown ids.
    pub fn run_total(&self, run_id: &str) -> (u64, f64) {
        let state = self.lock();
        match state.ledgers.get(run_id) {
            Some(entries) => entries
                .iter()
                .fold((0, 0.0), |(t, c), e| (t + e.total_tokens, c + e.cost_usd)),
            None => (0, 0.0),
        }
    }

    /// Session-wide (tokens, dollars) across all runs.
    pub fn session_total(&self) -> (u64, f64) {
        let state = self.lock();
        (state.total_tokens, state.total_cost_usd)
    }

    /// Delete a run's ledger and subtract exactly its contribution from the
    /// session totals. No-op for unknown ids.
    pub fn remove(&self, run_id: &str) {
        let mut state = self.lock();
        if let Some(entries) = state.ledgers.remove(run_id) {
            for e in &entries {
                state.total_tokens -= e.total_tokens;
                state.total_cost_usd -= e.cost_usd;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Why a run crossed its configured ceiling.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitBreach {
    Cost { cost_usd: f64, max_cost_usd: f64 },
    Tokens { tokens: u64, max_tokens: u64 },
}

impl std::fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitBreach::Cost {
                cost_usd,
                max_cost_usd,
            } => write!(f, "cost ${cost_usd:.4} reached limit ${max_cost_usd:.4}"),
            LimitBreach::Tokens { tokens, max_tokens } => {
                write!(f, "{tokens} tokens reached limit {max_tokens}")
            }
        }
    }
}

/// Stateless threshold checker. A zero threshold disables that dimension.
#[derive(Debug, Default, Clone, Copy)]
pub struct LimitChecker {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
}

impl LimitChecker {
    pub fn new(max_tokens: u64, max_cost_usd: f64) -> Self {
        Self {
            max_tokens,
            max_cost_usd,
        }
    }

    /// Report a breach iff `cost >= max_cost > 0` (checked first) or
    /// `tokens >= max_tokens > 0`. Comparisons are inclusive.
    pub fn check_run(&self, tokens: u64, cost_usd: f64) -> Option<LimitBreach> {
        if self.max_cost_usd > 0.0 && cost_usd >= self.max_cost_usd {
            return Some(LimitBreach::Cost {
                cost_usd,
                max_cost_usd: self.max_cost_usd,
            });
        }
        if self.max_tokens > 0 && tokens >= self.max_tokens {
            return Some(LimitBreach::Tokens {
                tokens,
                max_tokens: self.max_tokens,
            });
        }
        None
    }
}
