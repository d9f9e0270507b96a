//! Query-time retrieval: embed the query, search the index, threshold, rank.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{IndexError, RagError, Result, Stage};
use crate::index::VectorIndexManager;
use crate::metrics::MetricsRecorder;
use crate::models::RetrievedChunk;
use crate::orchestrator::EmbeddingOrchestrator;

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: usize,
    pub min_similarity: f32,
    /// Restrict to these documents; empty means the whole collection.
    pub document_filter: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalResponse {
    /// Ranked best first; never longer than `top_k`.
    pub results: Vec<RetrievedChunk>,
    pub embedding_time: Duration,
    pub search_time: Duration,
}

pub struct RetrievalEngine {
    orchestrator: Arc<EmbeddingOrchestrator>,
    index: Arc<VectorIndexManager>,
    model_id: String,
    search_timeout: Duration,
    metrics: MetricsRecorder,
}

impl RetrievalEngine {
    pub fn new(
        orchestrator: Arc<EmbeddingOrchestrator>,
        index: Arc<VectorIndexManager>,
        model_id: impl Into<String>,
        search_timeout: Duration,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            orchestrator,
            index,
            model_id: model_id.into(),
            search_timeout,
            metrics,
        }
    }

    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResponse> {
        if request.query.trim().is_empty() {
            return Err(RagError::validation(Stage::Search, "query text is empty"));
        }
        if request.top_k == 0 {
            return Err(RagError::validation(Stage::Search, "top_k must be at least 1"));
        }
        if !request.min_similarity.is_finite() {
            return Err(RagError::validation(
                Stage::Search,
                "min_similarity must be a finite number",
            ));
        }

        let started = Instant::now();
        let embedding = self
            .orchestrator
            .embed_one(&request.query, &self.model_id)
            .await?;
        let embedding_time = started.elapsed();

        let started = Instant::now();
        let index = self.index.clone();
        let top_k = request.top_k;
        let filter = request.document_filter.clone();
        let task = tokio::task::spawn_blocking(move || {
            let filter = (!filter.is_empty()).then_some(filter.as_slice());
            index.search(&embedding, top_k, filter)
        });
        let hits = match tokio::time::timeout(self.search_timeout, task).await {
            Ok(Ok(hits)) => hits?,
            Ok(Err(join)) => {
                return Err(RagError::index(
                    Stage::Search,
                    IndexError::Corrupted(format!("search task failed: {}", join)),
                ))
            }
            Err(_) => {
                return Err(RagError::Timeout {
                    stage: Stage::Search,
                    elapsed: started.elapsed(),
                })
            }
        };
        let search_time = started.elapsed();

        let results: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|h| h.similarity >= request.min_similarity)
            .take(request.top_k)
            .enumerate()
            .map(|(i, h)| RetrievedChunk {
                rank: i + 1,
                chunk_id: h.chunk_id,
                document_id: h.document_id,
                chunk_number: h.chunk_number,
                similarity: h.similarity,
            })
            .collect();

        let similarities: Vec<f32> = results.iter().map(|r| r.similarity).collect();
        self.metrics
            .record_query(embedding_time, search_time, &similarities);
        tracing::debug!(
            results = results.len(),
            embed_ms = embedding_time.as_millis() as u64,
            search_ms = search_time.as_millis() as u64,
            "retrieval complete"
        );

        Ok(RetrievalResponse {
            results,
            embedding_time,
            search_time,
        })
    }
}
