/// Configuration module for codeward.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::resilience::{BreakerConfig, RetryPolicy};

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./codeward.db".to_string()
}

fn default_chunk_lines() -> usize {
    50
}

fn default_overlap_lines() -> usize {
    10
}

fn default_max_lines() -> usize {
    200
}

fn default_min_lines() -> usize {
    5
}

fn default_embedding_model() -> String {
    "embeddinggemma:300m".to_string()
}

fn default_dimensions() -> usize {
    768
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_analysis_model() -> String {
    "qwen3-coder:30b".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_top_k_context() -> usize {
    5
}

fn default_context_char_budget() -> usize {
    12_000
}

fn default_near_duplicate_threshold() -> f64 {
    0.9
}

fn default_worker_batch_size() -> usize {
    10
}

fn default_unit_lines() -> usize {
    400
}

fn default_exclusions() -> Vec<String> {
    [
        "**/node_modules/**",
        "**/venv/**",
        "**/.venv/**",
        "**/virtualenv/**",
        "**/.git/**",
        "**/dist/**",
        "**/build/**",
        "**/__pycache__/**",
        "**/target/**",
        "**/vendor/**",
        "**/*.min.js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Explicit project key; derived from the repository root when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_lines")]
    pub chunk_lines: usize,

    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,

    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    #[serde(default = "default_min_lines")]
    pub min_lines: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,

    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_top_k_context")]
    pub top_k_context: usize,

    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,

    #[serde(default = "default_near_duplicate_threshold")]
    pub near_duplicate_threshold: f64,

    #[serde(default)]
    pub validate_findings: bool,

    /// Maximum number of files / review units processed concurrently.
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,

    /// Files longer than this are reviewed in windows of this many lines.
    #[serde(default = "default_unit_lines")]
    pub unit_lines: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            project_id: None,
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerSettings::default(),
            analysis: AnalysisConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_lines: default_chunk_lines(),
            overlap_lines: default_overlap_lines(),
            max_lines: default_max_lines(),
            min_lines: default_min_lines(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            analysis_model: default_analysis_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_secs: default_cooldown_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            top_k_context: default_top_k_context(),
            context_char_budget: default_context_char_budget(),
            near_duplicate_threshold: default_near_duplicate_threshold(),
            validate_findings: false,
            batch_size: default_worker_batch_size(),
            unit_lines: default_unit_lines(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            exclusions: default_exclusions(),
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

impl BreakerSettings {
    #[must_use]
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the default configuration. A file that exists
    /// but cannot be read or parsed is an error: silently reverting to
    /// defaults could point the run at the wrong index.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "codeward.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        let cfg: Config =
            serde_json::from_str(&data).with_context(|| format!("invalid JSON in {path}"))?;

        info!("Loaded configuration from {path}");
        if cfg.discovery.exclusions.is_empty() {
            warn!("No discovery exclusions configured; vendored code will be indexed");
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        anyhow::ensure!(c.chunk_lines > 0, "chunking.chunk_lines must be positive");
        anyhow::ensure!(
            c.overlap_lines < c.chunk_lines,
            "chunking.overlap_lines must be less than chunking.chunk_lines"
        );
        anyhow::ensure!(
            c.max_lines >= c.chunk_lines,
            "chunking.max_lines must be at least chunking.chunk_lines"
        );
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            self.embedding.batch_size > 0,
            "embedding.batch_size must be positive"
        );
        anyhow::ensure!(self.llm.timeout_secs > 0, "llm.timeout_secs must be positive");
        anyhow::ensure!(
            self.retry.exponential_base >= 1.0,
            "retry.exponential_base must be at least 1.0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.retry.jitter),
            "retry.jitter must be within [0, 1]"
        );
        anyhow::ensure!(
            self.breaker.failure_threshold > 0,
            "breaker.failure_threshold must be positive"
        );
        anyhow::ensure!(
            self.breaker.success_threshold > 0,
            "breaker.success_threshold must be positive"
        );
        anyhow::ensure!(
            self.breaker.half_open_max_calls > 0,
            "breaker.half_open_max_calls must be positive"
        );
        anyhow::ensure!(
            self.analysis.top_k_context > 0,
            "analysis.top_k_context must be positive"
        );
        anyhow::ensure!(
            self.analysis.batch_size > 0,
            "analysis.batch_size must be positive"
        );
        anyhow::ensure!(
            self.analysis.unit_lines > 0,
            "analysis.unit_lines must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.analysis.near_duplicate_threshold),
            "analysis.near_duplicate_threshold must be within [0, 1]"
        );
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
