//! Configuration for cogtask.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "COGTASK_DATA_DIR";

/// cogtask configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the registry, checkpoints and exports.
    pub data_dir: PathBuf,
    /// Lifecycle settings.
    pub scheduler: SchedulerSettings,
    /// Working memory pool limits.
    pub pool: PoolSettings,
    /// Priority scoring weights and half-lives.
    pub scoring: ScoringConfig,
    /// Checkpoint triggers and retention.
    pub checkpoint: CheckpointSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cogtask");

        Self {
            data_dir,
            scheduler: SchedulerSettings::default(),
            pool: PoolSettings::default(),
            scoring: ScoringConfig::default(),
            checkpoint: CheckpointSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_unresolved(config_path)?;
        match std::env::var(DATA_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => config.data_dir = PathBuf::from(dir),
            _ => {}
        }
        Ok(config)
    }

    fn load_unresolved(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/cogtask/cogtask.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("cogtask").join("cogtask.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./cogtask.yml
        let fallback_config = PathBuf::from("cogtask.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings the scheduler cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_entries == 0 {
            eyre::bail!("pool.max_entries must be at least 1");
        }
        if self.pool.half_life_secs <= 0.0 {
            eyre::bail!("pool.half_life_secs must be positive");
        }
        if self.scoring.weights.total() <= 0.0 {
            eyre::bail!("scoring.weights must not all be zero");
        }
        Ok(())
    }

    /// Path of the durable task registry.
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    /// Directory holding checkpoints.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory receiving exported decision records.
    pub fn decisions_dir(&self) -> PathBuf {
        self.data_dir.join("decisions")
    }

    /// Directory receiving exported session summaries.
    pub fn summaries_dir(&self) -> PathBuf {
        self.data_dir.join("summaries")
    }

    /// Queue file for reindex requests.
    pub fn reindex_queue_path(&self) -> PathBuf {
        self.data_dir.join("reindex-queue.jsonl")
    }

    /// Log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Lifecycle settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Spawn requests activation unless told otherwise.
    pub auto_activate_on_spawn: bool,
    /// An activating spawn pauses the current ACTIVE task instead of staying paused.
    pub preempt_on_spawn: bool,
}

/// Working memory pool limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum resident entries.
    pub max_entries: usize,
    /// Maximum total resident weight.
    pub max_weight: u64,
    /// Half-life of the pool's recency term, in seconds.
    pub half_life_secs: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_entries: 5,
            max_weight: 8000,
            half_life_secs: 3600.0,
        }
    }
}

/// Relative weights of the priority sub-scores.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub urgency: f64,
    pub recency: f64,
    pub value: f64,
    pub novelty: f64,
    pub user_signal: f64,
    pub error_boost: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            urgency: 0.25,
            recency: 0.20,
            value: 0.20,
            novelty: 0.15,
            user_signal: 0.15,
            error_boost: 0.05,
        }
    }
}

impl ScoreWeights {
    /// Sum of all weights (negative weights count as zero).
    pub fn total(&self) -> f64 {
        [
            self.urgency,
            self.recency,
            self.value,
            self.novelty,
            self.user_signal,
            self.error_boost,
        ]
        .iter()
        .map(|w| w.max(0.0))
        .sum()
    }
}

/// Priority scoring configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    /// Half-life of the recency term, in hours.
    pub recency_half_life_hours: f64,
    /// Half-life of the novelty term, in days.
    pub novelty_half_life_days: f64,
    /// Remaining time at which a deadline contributes half urgency, in hours.
    pub deadline_half_life_hours: f64,
    /// Error count at which the error boost saturates.
    pub error_cap: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            recency_half_life_hours: 24.0,
            novelty_half_life_days: 7.0,
            deadline_half_life_hours: 24.0,
            error_cap: 5,
        }
    }
}

/// Checkpoint triggers and retention.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Write a checkpoint after this many lifecycle transitions (0 = never).
    pub every_transitions: u32,
    /// Number of checkpoints kept on disk.
    pub retain: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            every_transitions: 10,
            retain: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.max_entries, 5);
        assert_eq!(config.pool.max_weight, 8000);
        assert_eq!(config.checkpoint.every_transitions, 10);
        assert!(!config.scheduler.auto_activate_on_spawn);
        assert!((config.scoring.weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_paths() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/test"),
            ..Default::default()
        };

        assert_eq!(config.registry_path(), PathBuf::from("/tmp/test/registry.json"));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/tmp/test/checkpoints"));
        assert_eq!(config.reindex_queue_path(), PathBuf::from("/tmp/test/reindex-queue.jsonl"));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yml");

        let config_content = r#"
data_dir: /custom/path
scheduler:
  auto_activate_on_spawn: true
pool:
  max_entries: 3
  max_weight: 1200
scoring:
  weights:
    urgency: 0.5
  error_cap: 10
checkpoint:
  every_transitions: 4
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/path"));
        assert!(config.scheduler.auto_activate_on_spawn);
        assert!(!config.scheduler.preempt_on_spawn);
        assert_eq!(config.pool.max_entries, 3);
        assert_eq!(config.pool.max_weight, 1200);
        assert_eq!(config.pool.half_life_secs, 3600.0);
        assert_eq!(config.scoring.weights.urgency, 0.5);
        assert_eq!(config.scoring.weights.recency, 0.20);
        assert_eq!(config.scoring.error_cap, 10);
        assert_eq!(config.checkpoint.every_transitions, 4);
        assert_eq!(config.checkpoint.retain, 20);
    }

    #[test]
    fn test_rejects_empty_pool() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yml");
        fs::write(&config_path, "pool:\n  max_entries: 0\n").unwrap();

        assert!(Config::load_from_file(&config_path).is_err());
    }
}
