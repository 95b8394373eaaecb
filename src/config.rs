use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::RiskLevel;
use crate::util::RetryConfig;
use crate::{llog_debug, Error, Result};

/// How worker output becomes tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// Workers return tool calls themselves.
    #[default]
    Direct,
    /// A translator model converts each worker artifact into tool calls.
    Translated,
}

/// When the planner model is asked to decompose a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionMode {
    /// Short single-step goals skip the planner.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_lanes: usize,
    pub max_rework_attempts: u32,
    pub worker_timeout_secs: u64,
    pub max_reconciliations: u32,
    pub tool_mode: ToolMode,
    pub decomposition: DecompositionMode,
    pub auto_single_node_max_words: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_lanes: 3,
            max_rework_attempts: 2,
            worker_timeout_secs: 300,
            max_reconciliations: 2,
            tool_mode: ToolMode::Direct,
            decomposition: DecompositionMode::Auto,
            auto_single_node_max_words: 12,
        }
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelRate {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    pub fast: String,
    pub standard: String,
    pub strong: String,
    pub planner: String,
    pub verifier: String,
    pub judge: String,
    pub translator: String,
    /// External command used by the CLI model client.
    pub command: Option<String>,
    pub rates: HashMap<String, ModelRate>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let rates = [
            ("haiku", ModelRate { input: 0.8, output: 4.0 }),
            ("sonnet", ModelRate { input: 3.0, output: 15.0 }),
            ("opus", ModelRate { input: 15.0, output: 75.0 }),
        ]
        .into_iter()
        .map(|(name, rate)| (name.to_string(), rate))
        .collect();

        Self {
            fast: "haiku".to_string(),
            standard: "sonnet".to_string(),
            strong: "opus".to_string(),
            planner: "sonnet".to_string(),
            verifier: "sonnet".to_string(),
            judge: "opus".to_string(),
            translator: "haiku".to_string(),
            command: None,
            rates,
        }
    }
}

impl ModelsConfig {
    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Token cap for one orchestration run.
    pub per_request_tokens: u64,
    /// Token cap per UTC calendar day.
    pub daily_tokens: u64,
    /// Fraction of either cap at which a warning is emitted.
    pub warn_ratio: f64,
    /// Optional USD cap for one run, priced with `models.rates`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_request_tokens: 2_000_000,
            daily_tokens: 20_000_000,
            warn_ratio: 0.8,
            max_cost_usd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StallConfig {
    pub max_no_progress: u32,
    pub max_repeated: u32,
    pub max_elapsed_secs: u64,
    pub max_steps: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            max_no_progress: 5,
            max_repeated: 3,
            max_elapsed_secs: 30 * 60,
            max_steps: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive lane failures that open the breaker.
    pub threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityGateConfig {
    pub enabled: bool,
    /// Nodes with complexity at or above this, or high/critical risk, are judged.
    pub complexity_threshold: u8,
    pub min_score: f64,
    /// Review the whole run once every node resolves.
    pub run_review: bool,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            complexity_threshold: 7,
            min_score: 6.0,
            run_review: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    pub enabled: bool,
    /// Voter model ids; each casts one independent vote.
    pub voters: Vec<String>,
    pub quorum: usize,
    /// Lowest risk level that requires consensus before merge.
    pub min_risk: RiskLevel,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            voters: vec![
                "sonnet".to_string(),
                "opus".to_string(),
                "haiku".to_string(),
            ],
            quorum: 2,
            min_risk: RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// Shell command run as the level-2 build check.
    pub build_command: Option<String>,
    pub lint: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            lint: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub models: ModelsConfig,
    pub budget: BudgetConfig,
    pub stall: StallConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub quality_gate: QualityGateConfig,
    pub consensus: ConsensusConfig,
    pub merge: MergeConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

impl Config {
    pub fn lanes_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".lanes"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::lanes_dir()?.join("lanes.toml"))
    }

    /// Load `~/.lanes/lanes.toml`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        llog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            llog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        llog_debug!(
            "Config loaded: lanes={}, rework={}, tool_mode={:?}",
            config.orchestrator.max_concurrent_lanes,
            config.orchestrator.max_rework_attempts,
            config.orchestrator.tool_mode
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        llog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent_lanes == 0 {
            return Err(Error::Validation(
                "orchestrator.max_concurrent_lanes must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.budget.warn_ratio) {
            return Err(Error::Validation(
                "budget.warn_ratio must be between 0 and 1".to_string(),
            ));
        }
        if self.consensus.enabled {
            if self.consensus.quorum == 0 {
                return Err(Error::Validation(
                    "consensus.quorum must be at least 1".to_string(),
                ));
            }
            if self.consensus.quorum > self.consensus.voters.len() {
                return Err(Error::Validation(format!(
                    "consensus.quorum ({}) exceeds voter count ({})",
                    self.consensus.quorum,
                    self.consensus.voters.len()
                )));
            }
        }
        Ok(())
    }
}
