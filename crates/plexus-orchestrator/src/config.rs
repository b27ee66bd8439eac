use crate::executor::{ExecutionMode, ExecutorOptions, RetryPolicy};
use crate::types::StrategyKind;
use crate::verifier::VerificationLevel;
use plexus_core::{PlexusError, PlexusResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration, usually read from `plexus.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    /// Directory for the JSONL audit log; disabled when unset.
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> PlexusResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| PlexusError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; a missing file yields the defaults.
    pub async fn load(path: &Path) -> PlexusResult<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> PlexusResult<()> {
        if !(0.0..=1.0).contains(&self.planner.confidence_floor) {
            return Err(PlexusError::Config(format!(
                "planner.confidence_floor must be within [0, 1], got {}",
                self.planner.confidence_floor
            )));
        }
        if self.planner.strategies.is_empty() {
            return Err(PlexusError::Config(
                "planner.strategies must name at least one strategy".into(),
            ));
        }
        if self.planner.max_tasks == 0 {
            return Err(PlexusError::Config("planner.max_tasks must be positive".into()));
        }
        if self.cache.capacity == 0 {
            return Err(PlexusError::Config("cache.capacity must be positive".into()));
        }
        if self.executor.workers == 0 {
            return Err(PlexusError::Config("executor.workers must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.verifier.review_threshold) {
            return Err(PlexusError::Config(format!(
                "verifier.review_threshold must be within [0, 1], got {}",
                self.verifier.review_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Minimum confidence a strategy must exceed for its plan to be accepted.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Strategies in the order they are tried.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
    /// Larger proposals are rejected.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            strategies: default_strategies(),
            max_tasks: default_max_tasks(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Period of the background expiry sweep; 0 disables it.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Directory of the file-backed plan store.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_ttl_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            store_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn eviction_interval(&self) -> Option<Duration> {
        (self.eviction_interval_secs > 0).then(|| Duration::from_secs(self.eviction_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Adaptive mode switches to the full pool once this many tasks are queued.
    #[serde(default = "default_adaptive_threshold")]
    pub adaptive_threshold: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Seed for steal-victim selection; random when unset.
    #[serde(default)]
    pub steal_seed: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            workers: default_workers(),
            adaptive_threshold: default_adaptive_threshold(),
            default_timeout_ms: default_timeout_ms(),
            retry: RetryConfig::default(),
            cancellation_grace_ms: default_cancellation_grace_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            steal_seed: None,
        }
    }
}

impl ExecutorConfig {
    pub fn to_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            mode: self.mode,
            workers: self.workers.max(1),
            adaptive_threshold: self.adaptive_threshold,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            retry: RetryPolicy {
                backoff_base_ms: self.retry.backoff_base_ms,
                backoff_max_ms: self.retry.backoff_max_ms,
            },
            cancellation_grace: Duration::from_millis(self.cancellation_grace_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms.max(1)),
            steal_seed: self.steal_seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub level: VerificationLevel,
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            level: VerificationLevel::default(),
            review_threshold: default_review_threshold(),
        }
    }
}

fn default_confidence_floor() -> f64 {
    0.5
}
fn default_strategies() -> Vec<StrategyKind> {
    vec![
        StrategyKind::RuleBased,
        StrategyKind::ModelBased,
        StrategyKind::Hybrid,
    ]
}
fn default_max_tasks() -> usize {
    64
}
fn default_cache_capacity() -> usize {
    256
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_eviction_interval_secs() -> u64 {
    60
}
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_adaptive_threshold() -> usize {
    4
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_cancellation_grace_ms() -> u64 {
    2_000
}
fn default_idle_poll_ms() -> u64 {
    5
}
fn default_review_threshold() -> f64 {
    0.6
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.planner.confidence_floor, 0.5);
        assert_eq!(config.planner.strategies.len(), 3);
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.executor.mode, ExecutionMode::Adaptive);
        assert_eq!(config.executor.retry.backoff_base_ms, 200);
        assert_eq!(config.verifier.level, VerificationLevel::Strict);
        assert!(config.audit_dir.is_none());
        assert!(config.executor.workers >= 1);
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            audit_dir = "/var/log/plexus"

            [planner]
            confidence_floor = 0.7
            strategies = ["model_based", "rule_based"]

            [cache]
            capacity = 8
            ttl_secs = 120
            eviction_interval_secs = 0
            store_dir = "plans"

            [executor]
            mode = "parallel"
            workers = 3
            steal_seed = 42

            [executor.retry]
            backoff_base_ms = 10

            [verifier]
            level = "paranoid"
            review_threshold = 0.8
        "#;
        let config = OrchestratorConfig::from_toml_str(raw).unwrap();
        assert_eq!(
            config.planner.strategies,
            vec![StrategyKind::ModelBased, StrategyKind::RuleBased]
        );
        assert_eq!(config.cache.eviction_interval(), None);
        assert_eq!(config.cache.store_dir, Some(PathBuf::from("plans")));
        assert_eq!(config.executor.mode, ExecutionMode::Parallel);
        assert_eq!(config.executor.retry.backoff_max_ms, 5_000);
        assert_eq!(config.verifier.level, VerificationLevel::Paranoid);

        let options = config.executor.to_options();
        assert_eq!(options.workers, 3);
        assert_eq!(options.steal_seed, Some(42));
        assert_eq!(options.retry.backoff_base_ms, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = OrchestratorConfig::from_toml_str("[planner]\nconfidence_floor = 1.5").unwrap_err();
        assert!(matches!(err, PlexusError::Config(_)));

        let err = OrchestratorConfig::from_toml_str("[executor]\nworkers = 0").unwrap_err();
        assert!(matches!(err, PlexusError::Config(_)));

        let err = OrchestratorConfig::from_toml_str("[executor]\nmode = \"turbo\"").unwrap_err();
        assert!(matches!(err, PlexusError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }
}
