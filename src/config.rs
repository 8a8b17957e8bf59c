use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_target_tokens() -> usize {
    300
}
fn default_overlap_tokens() -> usize {
    50
}

/// Similarity thresholds bounding the automatic-decision zone.
///
/// Scores at or above `merge_threshold` merge without a completion call;
/// scores at or below `create_threshold` create without one. The band in
/// between is the verify band and costs one completion call per topic.
#[derive(Debug, Deserialize, Clone)]
pub struct DecisionConfig {
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f32,
    #[serde(default = "default_create_threshold")]
    pub create_threshold: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            merge_threshold: default_merge_threshold(),
            create_threshold: default_create_threshold(),
        }
    }
}

fn default_merge_threshold() -> f32 {
    0.85
}
fn default_create_threshold() -> f32 {
    0.65
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum spacing between remote calls, in milliseconds.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Base URL override, e.g. for a proxy or compatible provider.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            min_interval_ms: default_min_interval_ms(),
            base_url: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_interval_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: default_completion_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_completion_timeout_secs(),
            min_interval_ms: default_min_interval_ms(),
            base_url: None,
        }
    }
}

fn default_completion_provider() -> String {
    "openai".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Presentation variant stamped on generated documents.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Upper bound on summary excerpt length, in characters.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            summary_chars: default_summary_chars(),
        }
    }
}

fn default_mode() -> String {
    "expanded".to_string()
}
fn default_summary_chars() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Maximum documents materialized concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }

    let d = &config.decision;
    if !(0.0..=1.0).contains(&d.merge_threshold) || !(0.0..=1.0).contains(&d.create_threshold) {
        anyhow::bail!("decision thresholds must be in [0.0, 1.0]");
    }
    if d.create_threshold >= d.merge_threshold {
        anyhow::bail!(
            "decision.create_threshold ({}) must be below decision.merge_threshold ({})",
            d.create_threshold,
            d.merge_threshold
        );
    }

    let e = &config.embedding;
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match e.provider.as_str() {
        "openai" => {
            if e.model.is_none() {
                anyhow::bail!("embedding.model must be specified for provider 'openai'");
            }
            if e.dims.is_none() || e.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 for provider 'openai'");
            }
        }
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be openai.", other),
    }

    match config.completion.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown completion provider: '{}'. Must be openai.", other),
    }

    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[db]
path = "/tmp/curator.sqlite"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536
"#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.target_tokens, 300);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.decision.merge_threshold, 0.85);
        assert_eq!(config.decision.create_threshold, 0.65);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.ingest.concurrency, 4);
        assert_eq!(config.generation.mode, "expanded");
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.decision.create_threshold = 0.9;
        config.decision.merge_threshold = 0.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_target_tokens_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.chunking.target_tokens = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_openai_embedding_requires_model_and_dims() {
        let toml_str = r#"
[db]
path = "/tmp/curator.sqlite"

[embedding]
provider = "openai"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.embedding.provider = "cohere".to_string();
        assert!(validate(&config).is_err());
    }
}
