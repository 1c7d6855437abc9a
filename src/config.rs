//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or no `[section]` at all)
//! yields a usable configuration. [`load_config`] validates ranges.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::generator::MAX_GENERATION_BATCH;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/mailtrace.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_persist_timeout_secs")]
    pub persist_timeout_secs: u64,
    /// Slack added to the summed sandbox budgets when bounding rule scoring
    /// for a whole batch.
    #[serde(default = "default_rule_grace_ms")]
    pub rule_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_body_bytes: default_max_body_bytes(),
            generate_timeout_secs: default_generate_timeout_secs(),
            persist_timeout_secs: default_persist_timeout_secs(),
            rule_grace_ms: default_rule_grace_ms(),
        }
    }
}

fn default_max_batch_size() -> usize {
    50
}
fn default_max_body_bytes() -> usize {
    100 * 1024
}
fn default_generate_timeout_secs() -> u64 {
    120
}
fn default_persist_timeout_secs() -> u64 {
    30
}
fn default_rule_grace_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    /// Exact addresses, or `@domain` suffixes.
    #[serde(default)]
    pub sender_allowlist: Vec<String>,
    /// Directory of additional `*.lua` rules, appended after the built-ins.
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            sender_allowlist: Vec::new(),
            rules_dir: None,
        }
    }
}

fn default_sandbox_timeout_ms() -> u64 {
    5_000
}
fn default_memory_limit_mb() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// `"local"` (Ollama) or `"remote"` (OpenAI-compatible).
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            model: default_model(),
            url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_mode() -> String {
    "local".to_string()
}
fn default_model() -> String {
    "qwen2.5:7b".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfidenceConfig {
    #[serde(default = "default_degraded_max")]
    pub degraded_max: f64,
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            degraded_max: default_degraded_max(),
            anomaly_threshold: default_anomaly_threshold(),
        }
    }
}

fn default_degraded_max() -> f64 {
    0.6
}
fn default_anomaly_threshold() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "local" | "remote" => {}
            other => bail!(
                "Unknown generator mode: '{}'. Must be local or remote.",
                other
            ),
        }
        if self.model.trim().is_empty() {
            bail!("generator.model must not be empty");
        }
        if self.timeout_secs == 0 {
            bail!("generator.timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            bail!("sandbox.timeout_ms must be > 0");
        }
        if self.memory_limit_mb == 0 {
            bail!("sandbox.memory_limit_mb must be > 0");
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_batch_size == 0 {
            bail!("pipeline.max_batch_size must be > 0");
        }
        if self.pipeline.max_batch_size > MAX_GENERATION_BATCH {
            bail!(
                "pipeline.max_batch_size must be <= {} (generation batch cap)",
                MAX_GENERATION_BATCH
            );
        }
        if self.pipeline.max_body_bytes == 0 {
            bail!("pipeline.max_body_bytes must be > 0");
        }
        if self.pipeline.generate_timeout_secs == 0 || self.pipeline.persist_timeout_secs == 0 {
            bail!("pipeline timeouts must be > 0");
        }
        self.sandbox.validate()?;
        self.generator.validate()?;
        if !(0.0..=1.0).contains(&self.confidence.degraded_max) {
            bail!("confidence.degraded_max must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.confidence.anomaly_threshold) {
            bail!("confidence.anomaly_threshold must be in [0.0, 1.0]");
        }
        Ok(())
    }
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
