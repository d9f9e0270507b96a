//! TOML configuration parsing and validation.
//!
//! Everything except `[db]` has defaults, so a minimal config file is just:
//!
//! ```toml
//! [db]
//! path = "./data/ragcli.sqlite"
//! ```
//!
//! [`load_config`] validates the file once at start-up, including the model
//! registry: every referenced model must exist with the right kind, and the
//! index dimension must match the embedding model's declared dimension.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{ModelCapability, ModelKind};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default = "default_models")]
    pub models: Vec<ModelCapability>,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            embedding_model: default_embedding_model(),
            chat_model: default_chat_model(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_chat_model() -> String {
    "gemma3:270m".to_string()
}

fn default_models() -> Vec<ModelCapability> {
    vec![
        ModelCapability {
            id: default_embedding_model(),
            kind: ModelKind::Embedding,
            dimension: 768,
            context_window: 8192,
        },
        ModelCapability {
            id: default_chat_model(),
            kind: ModelKind::Chat,
            dimension: 0,
            context_window: 32768,
        },
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap_percentage")]
    pub chunk_overlap_percentage: f64,
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap_percentage: default_overlap_percentage(),
            supported_formats: default_supported_formats(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

impl DocumentsConfig {
    pub fn overlap_fraction(&self) -> f64 {
        self.chunk_overlap_percentage / 100.0
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap_percentage() -> f64 {
    10.0
}
fn default_supported_formats() -> Vec<String> {
    vec!["txt".to_string(), "md".to_string()]
}
fn default_max_file_size_mb() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_exact_threshold")]
    pub exact_threshold: usize,
    #[serde(default = "default_graph_threshold")]
    pub graph_threshold: usize,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Number of coarse partitions for the hybrid index; 0 means `sqrt(N)`.
    #[serde(default)]
    pub partitions: usize,
    #[serde(default = "default_probes")]
    pub probes: usize,
    #[serde(default = "default_rebuild_timeout_secs")]
    pub rebuild_timeout_secs: u64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            exact_threshold: default_exact_threshold(),
            graph_threshold: default_graph_threshold(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            partitions: 0,
            probes: default_probes(),
            rebuild_timeout_secs: default_rebuild_timeout_secs(),
        }
    }
}

fn default_dimension() -> usize {
    768
}
fn default_exact_threshold() -> usize {
    1_000
}
fn default_graph_threshold() -> usize {
    100_000
}
fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}
fn default_probes() -> usize {
    8
}
fn default_rebuild_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity_score: f32,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    /// Limit for the chat model to start answering and for each gap between
    /// answer tokens.
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_log_queries")]
    pub log_queries: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity_score: default_min_similarity(),
            search_timeout_secs: default_search_timeout_secs(),
            generate_timeout_secs: default_generate_timeout_secs(),
            log_queries: default_log_queries(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.5
}
fn default_search_timeout_secs() -> u64 {
    10
}
fn default_generate_timeout_secs() -> u64 {
    60
}
fn default_log_queries() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    /// A configuration with every default applied and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            ollama: OllamaConfig::default(),
            models: default_models(),
            documents: DocumentsConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_index: VectorIndexConfig::default(),
            rag: RagConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Look up a registered model by id.
    pub fn model(&self, id: &str) -> Option<&ModelCapability> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Check cross-field constraints. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.documents.chunk_size == 0 {
            bail!("documents.chunk_size must be > 0");
        }
        if !(0.0..90.0).contains(&self.documents.chunk_overlap_percentage) {
            bail!("documents.chunk_overlap_percentage must be in [0, 90)");
        }
        if self.documents.supported_formats.is_empty() {
            bail!("documents.supported_formats must not be empty");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.workers == 0 {
            bail!("embedding.workers must be > 0");
        }
        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be > 0");
        }
        if self.embedding.base_delay_ms > self.embedding.max_delay_ms {
            bail!("embedding.base_delay_ms must not exceed embedding.max_delay_ms");
        }

        let vi = &self.vector_index;
        if vi.dimension == 0 {
            bail!("vector_index.dimension must be > 0");
        }
        if vi.exact_threshold >= vi.graph_threshold {
            bail!("vector_index.exact_threshold must be < vector_index.graph_threshold");
        }
        if vi.m < 2 {
            bail!("vector_index.m must be >= 2");
        }
        if vi.ef_construction == 0 || vi.ef_search == 0 || vi.probes == 0 {
            bail!("vector_index.ef_construction, ef_search and probes must be > 0");
        }

        if self.rag.top_k == 0 {
            bail!("rag.top_k must be >= 1");
        }
        if !self.rag.min_similarity_score.is_finite() {
            bail!("rag.min_similarity_score must be a finite number");
        }
        if self.rag.generate_timeout_secs == 0 {
            bail!("rag.generate_timeout_secs must be > 0");
        }

        self.validate_models()
    }

    fn validate_models(&self) -> Result<()> {
        for (i, model) in self.models.iter().enumerate() {
            if self.models[..i].iter().any(|m| m.id == model.id) {
                bail!("model '{}' is registered more than once", model.id);
            }
            if model.kind == ModelKind::Embedding && model.dimension == 0 {
                bail!("embedding model '{}' must declare a dimension > 0", model.id);
            }
            if model.context_window == 0 {
                bail!("model '{}' must declare a context_window > 0", model.id);
            }
        }

        let embed = self.model(&self.ollama.embedding_model).ok_or_else(|| {
            anyhow::anyhow!(
                "embedding model '{}' is not registered in [[models]]",
                self.ollama.embedding_model
            )
        })?;
        if embed.kind != ModelKind::Embedding {
            bail!("model '{}' is not an embedding model", embed.id);
        }
        if embed.dimension != self.vector_index.dimension {
            bail!(
                "vector_index.dimension ({}) does not match the dimension of '{}' ({})",
                self.vector_index.dimension,
                embed.id,
                embed.dimension
            );
        }

        let chat = self.model(&self.ollama.chat_model).ok_or_else(|| {
            anyhow::anyhow!(
                "chat model '{}' is not registered in [[models]]",
                self.ollama.chat_model
            )
        })?;
        if chat.kind != ModelKind::Chat {
            bail!("model '{}' is not a chat model", chat.id);
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(config.documents.chunk_size, 1000);
        assert!((config.documents.overlap_fraction() - 0.1).abs() < 1e-9);
        assert_eq!(config.vector_index.exact_threshold, 1_000);
        assert_eq!(config.vector_index.graph_threshold, 100_000);
        assert_eq!(config.embedding.max_retries, 3);
        assert_eq!(config.rag.top_k, 5);
        assert_eq!(config.model("nomic-embed-text").unwrap().dimension, 768);
    }

    #[test]
    fn rejects_dimension_mismatch_with_model() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [vector_index]
            dimension = 384
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_unregistered_embedding_model() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [ollama]
            embedding_model = "mxbai-embed-large"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn rejects_chat_model_used_for_embeddings() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [ollama]
            embedding_model = "llama3"
            chat_model = "llama3"

            [[models]]
            id = "llama3"
            kind = "chat"
            context_window = 8192
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not an embedding model"));
    }

    #[test]
    fn custom_registry_replaces_defaults() {
        let config = parse(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [ollama]
            embedding_model = "all-minilm"
            chat_model = "llama3"

            [vector_index]
            dimension = 384

            [[models]]
            id = "all-minilm"
            kind = "embedding"
            dimension = 384
            context_window = 512

            [[models]]
            id = "llama3"
            kind = "chat"
            context_window = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.models.len(), 2);
        assert!(config.model("nomic-embed-text").is_none());
    }

    #[test]
    fn rejects_bad_overlap_and_thresholds() {
        assert!(parse(
            "[db]\npath = \"/tmp/x\"\n[documents]\nchunk_overlap_percentage = 95\n"
        )
        .is_err());
        assert!(parse(
            "[db]\npath = \"/tmp/x\"\n[vector_index]\nexact_threshold = 5000\ngraph_threshold = 1000\n"
        )
        .is_err());
    }

    #[test]
    fn rejects_duplicate_models() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/x.sqlite"

            [[models]]
            id = "nomic-embed-text"
            kind = "embedding"
            dimension = 768
            context_window = 8192

            [[models]]
            id = "nomic-embed-text"
            kind = "embedding"
            dimension = 768
            context_window = 8192
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn example_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/ragcli.example.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.documents.chunk_size, 1000);
        assert_eq!(config.models.len(), 2);
    }
}
