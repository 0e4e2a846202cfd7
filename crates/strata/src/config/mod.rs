use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{ContentType, RetryPolicy};
use crate::error::{Result, StrataError};
use crate::scoring::ScoreWeights;
use crate::storage::PoolConfig;

/// Main configuration structure for Strata
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Retry budget and backoff for failed processing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Promotion thresholds and aggregate weights
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Transient buffer tier
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Connector batch intake
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Consolidation sweep and projection rules
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Store adapters and pools
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff step in seconds
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    300
}

impl LifecycleConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let secs = i64::try_from(self.retry_base_delay_secs).unwrap_or(i64::MAX);
        let base_delay =
            chrono::Duration::try_seconds(secs).unwrap_or_else(|| chrono::Duration::days(365));
        RetryPolicy::new(self.max_retries, base_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Confidence at or above which a completed chunk is promoted
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,
    /// Doubt at or above which a chunk is flagged for review
    #[serde(default = "default_doubt_threshold")]
    pub doubt_threshold: u8,
    #[serde(default)]
    pub weights: ScoreWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            doubt_threshold: default_doubt_threshold(),
            weights: ScoreWeights::default(),
        }
    }
}

fn default_confidence_threshold() -> u8 {
    70
}

fn default_doubt_threshold() -> u8 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Lifetime of a buffer-tier record, regardless of processing outcome
    #[serde(default = "default_buffer_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_buffer_ttl_secs(),
        }
    }
}

fn default_buffer_ttl_secs() -> u64 {
    3600
}

impl BufferConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Batches one connector may submit per window; 0 disables the limit
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

fn default_rate_limit() -> u64 {
    120
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

impl IntakeConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Chunks fetched per page while a sweep walks a tier
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Content types that also get a procedural projection when promoted
    #[serde(default = "default_procedural_content_types")]
    pub procedural_content_types: Vec<ContentType>,
    /// Content types that also get an episodic projection when promoted
    #[serde(default)]
    pub episodic_content_types: Vec<ContentType>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            batch_size: default_batch_size(),
            procedural_content_types: default_procedural_content_types(),
            episodic_content_types: Vec::new(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    500
}

fn default_procedural_content_types() -> Vec<ContentType> {
    vec![ContentType::Code, ContentType::List]
}

impl ConsolidationConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Which vector index backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Memory,
    Lance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for on-disk stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Slots per adapter pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Wait for a pool slot / connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for one store operation, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default)]
    pub vector_backend: VectorBackend,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            vector_backend: VectorBackend::default(),
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_embedding_dimensions() -> usize {
    384
}

impl StorageConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_size,
            acquire_timeout: Duration::from_millis(self.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StrataError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `path`, or the first of `~/.strata/config.toml`,
    /// `<config_dir>/strata/config.toml`, `./config.toml` that exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default_paths = [
                    dirs::home_dir().map(|h| h.join(".strata").join("config.toml")),
                    dirs::config_dir().map(|c| c.join("strata").join("config.toml")),
                    Some(PathBuf::from("config.toml")),
                ];
                match default_paths.iter().flatten().find(|p| p.exists()) {
                    Some(found) => Self::from_file(found)?,
                    None => {
                        tracing::info!("No config file found, using defaults");
                        Self::default()
                    }
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scoring.confidence_threshold > 100 || self.scoring.doubt_threshold > 100 {
            return Err(StrataError::Config(
                "score thresholds must be within 0..=100".to_string(),
            ));
        }
        self.scoring.weights.validate()?;
        if self.buffer.ttl_secs == 0 {
            return Err(StrataError::Config("buffer.ttl_secs must be positive".into()));
        }
        if self.intake.rate_limit_window_secs == 0 {
            return Err(StrataError::Config(
                "intake.rate_limit_window_secs must be positive".into(),
            ));
        }
        if self.consolidation.sweep_interval_secs == 0 {
            return Err(StrataError::Config(
                "consolidation.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.consolidation.batch_size == 0 {
            return Err(StrataError::Config(
                "consolidation.batch_size must be positive".into(),
            ));
        }
        if self.storage.pool_size == 0 {
            return Err(StrataError::Config("storage.pool_size must be positive".into()));
        }
        if self.storage.connect_timeout_ms >= self.storage.operation_timeout_ms {
            return Err(StrataError::Config(
                "storage.connect_timeout_ms must be shorter than storage.operation_timeout_ms"
                    .into(),
            ));
        }
        if self.storage.embedding_dimensions == 0 {
            return Err(StrataError::Config(
                "storage.embedding_dimensions must be positive".into(),
            ));
        }
        Ok(())
    }
}
