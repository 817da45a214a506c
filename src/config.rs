use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::normalize::NormalizationMode;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BuildConfig {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./dist")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_file")]
    pub file_name: String,
    #[serde(default)]
    pub normalization: NormalizationMode,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            file_name: default_snapshot_file(),
            normalization: NormalizationMode::default(),
        }
    }
}

fn default_snapshot_file() -> String {
    "snapshot.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    /// Properties present in fewer than this share of posts-with-frontmatter
    /// are reported as rare.
    #[serde(default = "default_rare_property_ratio")]
    pub rare_property_ratio: f64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            rare_property_ratio: default_rare_property_ratio(),
        }
    }
}

fn default_rare_property_ratio() -> f64 {
    0.10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum number of provider batches in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub embed_media: bool,
    /// Chunk size used when splitting post text before embedding.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            embed_media: false,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_tokens() -> usize {
    700
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimilarityConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_min_content_ratio")]
    pub min_content_ratio: f64,
    #[serde(default = "default_thin_content_chars")]
    pub thin_content_chars: usize,
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_content_ratio: default_min_content_ratio(),
            thin_content_chars: default_thin_content_chars(),
            required_fields: default_required_fields(),
        }
    }
}

fn default_min_content_ratio() -> f64 {
    0.10
}
fn default_thin_content_chars() -> usize {
    100
}
fn default_required_fields() -> Vec<String> {
    vec![
        "title".to_string(),
        "description".to_string(),
        "date".to_string(),
    ]
}

impl BuildConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.output.dir.join(&self.snapshot.file_name)
    }
}

/// Parse a TOML config string and validate it.
pub fn parse_config(content: &str) -> Result<BuildConfig> {
    let config: BuildConfig =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<BuildConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn validate_config(config: &BuildConfig) -> Result<()> {
    if config.snapshot.file_name.trim().is_empty() {
        anyhow::bail!("snapshot.file_name must not be empty");
    }

    if !(0.0..=1.0).contains(&config.schema.rare_property_ratio) {
        anyhow::bail!("schema.rare_property_ratio must be in [0.0, 1.0]");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }
    if config.embedding.max_tokens == 0 {
        anyhow::bail!("embedding.max_tokens must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.similarity.top_k == 0 {
        anyhow::bail!("similarity.top_k must be >= 1");
    }

    // Validate health checks
    if !(0.0..=1.0).contains(&config.validation.min_content_ratio) {
        anyhow::bail!("validation.min_content_ratio must be in [0.0, 1.0]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.output.dir, PathBuf::from("./dist"));
        assert_eq!(config.snapshot.normalization, NormalizationMode::Permissive);
        assert_eq!(config.similarity.top_k, 10);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.validation.required_fields.len(), 3);
    }

    #[test]
    fn test_normalization_mode_parses() {
        let config = parse_config("[snapshot]\nnormalization = \"strict\"\n").unwrap();
        assert_eq!(config.snapshot.normalization, NormalizationMode::Strict);
    }

    #[test]
    fn test_enabled_provider_requires_dims() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config("[embedding]\nprovider = \"magic\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Unknown embedding provider"));
    }

    #[test]
    fn test_zero_top_k_rejected() {
        assert!(parse_config("[similarity]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn test_snapshot_path_joins_output_dir() {
        let config = parse_config("[output]\ndir = \"/tmp/out\"\n").unwrap();
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/tmp/out/snapshot.sqlite")
        );
    }
}
