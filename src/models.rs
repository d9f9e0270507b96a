//! Core data models used throughout ragcli.
//!
//! These types represent the documents, chunks, queries and retrieval results
//! that flow through the ingestion and retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "READY" => Ok(DocumentStatus::Ready),
            "ERROR" => Ok(DocumentStatus::Error),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// Document record stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub format: String,
    pub size_bytes: i64,
    pub extracted_text_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub chunk_count: i64,
    pub total_tokens: i64,
    pub embedding_dimension: i64,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
}

/// A token-bounded span of a document's text.
///
/// Offsets are character (not byte) positions into the source text;
/// `end_offset` is exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_number: i64,
    pub text: String,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub hash: String,
}

impl Chunk {
    pub fn char_count(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// What a registered model can be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Embedding,
    Chat,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Embedding => f.write_str("embedding"),
            ModelKind::Chat => f.write_str("chat"),
        }
    }
}

/// Capability record for a model in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub id: String,
    pub kind: ModelKind,
    /// Vector dimension; only meaningful for embedding models.
    #[serde(default)]
    pub dimension: usize,
    pub context_window: usize,
}

/// A single ranked hit of a retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub rank: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_number: i64,
    pub similarity: f32,
}

/// Outcome of a logged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryStatus {
    Success,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Success => "SUCCESS",
            QueryStatus::Failed => "FAILED",
        }
    }
}

/// A logged query together with the parameters it ran with.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub id: String,
    pub text: String,
    pub document_filter: Vec<String>,
    pub top_k: usize,
    pub min_similarity: f32,
    pub embedding_time_ms: f64,
    pub search_time_ms: f64,
    pub status: QueryStatus,
    pub error_message: Option<String>,
    pub results: Vec<RetrievedChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DocumentStatus::Processing,
            DocumentStatus::Ready,
            DocumentStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>(), Ok(status));
        }
        assert!("DONE".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn model_capability_deserializes_from_toml() {
        let cap: ModelCapability = toml::from_str(
            r#"
            id = "nomic-embed-text"
            kind = "embedding"
            dimension = 768
            context_window = 8192
            "#,
        )
        .unwrap();
        assert_eq!(cap.kind, ModelKind::Embedding);
        assert_eq!(cap.dimension, 768);
    }
}
