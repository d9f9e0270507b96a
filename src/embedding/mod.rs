//! Embedding provider abstraction, model registry and vector utilities.
//!
//! - [`EmbeddingProvider`] is the seam between the orchestrator and whatever
//!   computes vectors. [`OllamaProvider`] is the production implementation;
//!   tests script their own.
//! - [`ModelRegistry`] maps model ids to their declared capabilities and is
//!   validated once, from configuration.
//! - [`vec_to_blob`] / [`blob_to_vec`] encode vectors for SQLite BLOB storage,
//!   and [`normalize`] / [`dot`] / [`cosine_similarity`] are the similarity
//!   primitives used by the index.
//!
//! # Error classes
//!
//! Providers classify every failure as a [`ProviderError`]:
//! - connection refused / DNS failure → `Unreachable`
//! - HTTP 429, 5xx, request timeout → `Transient` (retried by the orchestrator)
//! - other 4xx, malformed response → `Permanent`

mod ollama;

pub use ollama::OllamaProvider;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{ProviderError, RagError, Result, Stage};
use crate::models::{ModelCapability, ModelKind};

/// Computes a single embedding vector for a text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider name used in logs (e.g. `"ollama"`).
    fn name(&self) -> &str;

    async fn embed(&self, model_id: &str, text: &str) -> std::result::Result<Vec<f32>, ProviderError>;
}

/// Registry of known models and what they can do.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelCapability>,
}

impl ModelRegistry {
    pub fn new(models: impl IntoIterator<Item = ModelCapability>) -> Result<Self> {
        let mut registry = BTreeMap::new();
        for model in models {
            if model.kind == ModelKind::Embedding && model.dimension == 0 {
                return Err(RagError::Config(format!(
                    "embedding model '{}' must declare a dimension",
                    model.id
                )));
            }
            if registry.insert(model.id.clone(), model).is_some() {
                return Err(RagError::Config("duplicate model id in registry".into()));
            }
        }
        Ok(Self { models: registry })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.models.iter().cloned())
    }

    pub fn get(&self, id: &str) -> Option<&ModelCapability> {
        self.models.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelCapability> {
        self.models.values()
    }

    /// Declared dimension of an embedding model.
    pub fn embedding_dimension(&self, id: &str) -> Result<usize> {
        match self.models.get(id) {
            Some(m) if m.kind == ModelKind::Embedding => Ok(m.dimension),
            Some(_) => Err(RagError::Config(format!(
                "model '{}' is not an embedding model",
                id
            ))),
            None => Err(RagError::not_found(Stage::Embed, format!("model '{}'", id))),
        }
    }

    /// Ensure `id` is a registered chat model.
    pub fn require_chat(&self, id: &str) -> Result<&ModelCapability> {
        match self.models.get(id) {
            Some(m) if m.kind == ModelKind::Chat => Ok(m),
            Some(_) => Err(RagError::Config(format!("model '{}' is not a chat model", id))),
            None => Err(RagError::not_found(Stage::Config, format!("model '{}'", id))),
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use ragcli::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale `v` to unit length. Returns `None` for a zero (or non-finite) norm.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = dot(v, v).sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Cosine similarity, clamped to `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm input.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}
