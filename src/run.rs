//! Run records: one supervised execution of a coding agent against a prompt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::UsageData;

/// Lifecycle state of a run.
///
/// Transitions: `Idle → Running ⇄ Paused → {Completed, Failed}`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// Token/cost usage attributed to one named skill invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCost {
    pub skill: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl SkillCost {
    pub fn new(skill: &str, usage: &UsageData) -> Self {
        Self {
            skill: skill.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            cost_usd: usage.cost_usd,
            recorded_at: Utc::now(),
        }
    }
}

/// One supervised agent execution, mutated exclusively through the store's
/// locked update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub prompt: String,
    pub state: RunState,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Named phase of the run's workflow currently executing.
    #[serde(default)]
    pub skill: String,
    /// OS process id of the attached subprocess. Zero means none attached.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub skill_costs: Vec<SkillCost>,
    #[serde(default)]
    pub error: String,
}

impl Run {
    pub fn new(id: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            prompt: prompt.to_string(),
            state: RunState::Idle,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost_usd: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            skill: String::new(),
            pid: 0,
            skill_costs: Vec::new(),
            error: String::new(),
        }
    }

    /// Fold one usage report into the run's counters and per-skill history.
    pub fn record_usage(&mut self, skill: &str, usage: &UsageData) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.total_tokens;
        self.cost_usd += usage.cost_usd;
        self.skill_costs.push(SkillCost::new(skill, usage));
    }
}
