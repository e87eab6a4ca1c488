use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::cost::LimitChecker;
use crate::manager::{DEFAULT_ENTRY_CAPACITY, DEFAULT_LINE_CAPACITY, ManagerConfig};
use crate::protocol::AgentFlavor;

const CONFIG_PATH: &str = ".warden/config.toml";

/// Project-level supervision configuration from `.warden/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which event vocabulary the agent subprocess speaks.
    #[serde(default)]
    pub agent: AgentFlavor,
    /// Program spawned for each run; its arguments come before the prompt.
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard ceiling on simultaneously active subprocesses.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-run token ceiling; 0 disables.
    #[serde(default)]
    pub max_tokens: u64,
    /// Per-run dollar ceiling; 0 disables.
    #[serde(default)]
    pub max_cost_usd: f64,
    #[serde(default = "default_line_capacity")]
    pub line_buffer_capacity: usize,
    #[serde(default = "default_entry_capacity")]
    pub entry_buffer_capacity: usize,
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_line_capacity() -> usize {
    DEFAULT_LINE_CAPACITY
}

fn default_entry_capacity() -> usize {
    DEFAULT_ENTRY_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentFlavor::default(),
            program: default_program(),
            args: Vec::new(),
            max_concurrent: default_max_concurrent(),
            max_tokens: 0,
            max_cost_usd: 0.0,
            line_buffer_capacity: default_line_capacity(),
            entry_buffer_capacity: default_entry_capacity(),
        }
    }
}

impl Config {
    /// The manager tunables this configuration describes. Buffer capacities
    /// are clamped to at least one slot.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            flavor: self.agent,
            max_concurrent: self.max_concurrent,
            limits: LimitChecker::new(self.max_tokens, self.max_cost_usd),
            line_capacity: self.line_buffer_capacity.max(1),
            entry_capacity: self.entry_buffer_capacity.max(1),
        }
    }
}

/// Load configuration from `.warden/config.toml` under `project_root`.
///
/// Falls back to defaults if the file is missing.
pub fn load(project_root: &Path) -> Result<Config> {
    let path = project_root.join(CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    if config.line_buffer_capacity == 0 || config.entry_buffer_capacity == 0 {
        bail!("buffer capacities must be nonzero in {}", path.display());
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.agent, AgentFlavor::Claude);
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_tokens, 0);
        assert_eq!(config.line_buffer_capacity, DEFAULT_LINE_CAPACITY);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".warden")).unwrap();
        std::fs::write(
            dir.path().join(".warden/config.toml"),
            "agent = \"codex\"\nmax_cost_usd = 2.5\n",
        )
        .unwrap();

        let config = load(dir.path()).unwrap();
        assert_eq!(config.agent, AgentFlavor::Codex);
        assert!((config.max_cost_usd - 2.5).abs() < 1e-9);
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.program, "claude");
    }

    #[test]
    fn manager_config_carries_thresholds() {
        let config = Config {
            max_tokens: 1000,
            max_cost_usd: 1.0,
            max_concurrent: 2,
            ..Config::default()
        };
        let mc = config.manager_config();
        assert_eq!(mc.max_concurrent, 2);
        assert!(mc.limits.check_run(1000, 0.0).is_some());
        assert!(mc.limits.check_run(999, 0.99).is_none());
    }

    #[test]
    fn zero_capacity_is_rejected_on_load() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".warden")).unwrap();
        std::fs::write(
            dir.path().join(".warden/config.toml"),
            "line_buffer_capacity = 0\n",
        )
        .unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("nonzero"));
    }

    #[test]
    fn manager_config_clamps_zero_capacities() {
        let config = Config {
            line_buffer_capacity: 0,
            entry_buffer_capacity: 0,
            ..Config::default()
        };
        let mc = config.manager_config();
        assert_eq!(mc.line_capacity, 1);
        assert_eq!(mc.entry_capacity, 1);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".warden")).unwrap();
        std::fs::write(dir.path().join(".warden/config.toml"), "max_concurrent = ").unwrap();
        assert!(load(dir.path()).is_err());
    }
}
