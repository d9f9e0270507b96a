//! Query and ask entrypoints.
//!
//! `query` runs retrieval, joins each hit with its chunk text and source
//! filename, and (when `rag.log_queries` is set) writes the query and its
//! ranked results to the store. `ask` adds a streamed answer from the chat
//! model on top of the same retrieval.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::{
    build_rag_messages, cancellable, with_idle_timeout, ContextPassage, TokenStream,
};
use crate::engine::RagEngine;
use crate::error::{RagError, Result, Stage};
use crate::models::{QueryRecord, QueryStatus, RetrievedChunk};
use crate::retrieval::{RetrievalRequest, RetrievalResponse};
use crate::store;

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub query: String,
    /// Defaults to `rag.top_k`.
    pub top_k: Option<usize>,
    /// Defaults to `rag.min_similarity_score`.
    pub min_similarity: Option<f32>,
    pub document_filter: Vec<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// One ranked hit with the text it refers to.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub rank: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub chunk_number: i64,
    pub similarity: f32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub hits: Vec<QueryHit>,
    #[serde(serialize_with = "as_millis")]
    pub embedding_time: Duration,
    #[serde(serialize_with = "as_millis")]
    pub search_time: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

pub struct AskResponse {
    pub query: QueryResponse,
    /// Answer tokens; ends early when the cancellation token fires.
    pub tokens: TokenStream,
}

/// First `max_chars` characters of `text` on one line, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

impl RagEngine {
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let query_id = Uuid::new_v4().to_string();
        let retrieval = RetrievalRequest {
            query: request.query.clone(),
            top_k: request.top_k.unwrap_or(self.config.rag.top_k),
            min_similarity: request
                .min_similarity
                .unwrap_or(self.config.rag.min_similarity_score),
            document_filter: request.document_filter.clone(),
        };

        let outcome = self.retrieval.retrieve(retrieval.clone()).await;
        self.log_query(&query_id, &retrieval, &outcome).await;
        let response = outcome.map_err(|e| {
            self.metrics.record_error(e.kind());
            e
        })?;

        let ids: Vec<String> = response
            .results
            .iter()
            .map(|r| r.chunk_id.clone())
            .collect();
        let mut texts = store::chunk_texts(&self.pool, &ids).await?;
        let hits = response
            .results
            .into_iter()
            .map(|r| {
                let (filename, text) = texts
                    .remove(&r.chunk_id)
                    .map(|t| (t.filename, t.text))
                    .unwrap_or_default();
                QueryHit {
                    rank: r.rank,
                    chunk_id: r.chunk_id,
                    document_id: r.document_id,
                    filename,
                    chunk_number: r.chunk_number,
                    similarity: r.similarity,
                    text,
                }
            })
            .collect();

        Ok(QueryResponse {
            query_id,
            hits,
            embedding_time: response.embedding_time,
            search_time: response.search_time,
        })
    }

    /// Retrieve context for `request` and start streaming an answer.
    pub async fn ask(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<AskResponse> {
        let chat_model = self.config.ollama.chat_model.clone();
        self.orchestrator.registry().require_chat(&chat_model)?;

        let question = request.query.clone();
        let query = self.query(request).await?;
        let passages: Vec<ContextPassage> = query
            .hits
            .iter()
            .map(|h| ContextPassage {
                source: format!("{}#{}", h.filename, h.chunk_number),
                text: h.text.clone(),
            })
            .collect();

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled {
                stage: Stage::Generate,
            });
        }
        let limit = Duration::from_secs(self.config.rag.generate_timeout_secs);
        let started = tokio::time::timeout(
            limit,
            self.completion
                .stream_chat(&chat_model, build_rag_messages(&question, &passages)),
        )
        .await
        .map_err(|_| RagError::Timeout {
            stage: Stage::Generate,
            elapsed: limit,
        })
        .and_then(|r| r.map_err(|e| RagError::provider(Stage::Generate, e)));
        let stream = started.map_err(|err| {
            self.metrics.record_error(err.kind());
            err
        })?;

        Ok(AskResponse {
            query,
            tokens: cancellable(with_idle_timeout(stream, limit), cancel.clone()),
        })
    }

    async fn log_query(
        &self,
        query_id: &str,
        request: &RetrievalRequest,
        outcome: &Result<RetrievalResponse>,
    ) {
        if !self.config.rag.log_queries {
            return;
        }
        let (status, error_message, results, embed_ms, search_ms) = match outcome {
            Ok(r) => (
                QueryStatus::Success,
                None,
                r.results.clone(),
                r.embedding_time.as_secs_f64() * 1000.0,
                r.search_time.as_secs_f64() * 1000.0,
            ),
            Err(e) => (
                QueryStatus::Failed,
                Some(e.to_string()),
                Vec::<RetrievedChunk>::new(),
                0.0,
                0.0,
            ),
        };
        let record = QueryRecord {
            id: query_id.to_string(),
            text: request.query.clone(),
            document_filter: request.document_filter.clone(),
            top_k: request.top_k,
            min_similarity: request.min_similarity,
            embedding_time_ms: embed_ms,
            search_time_ms: search_ms,
            status,
            error_message,
            results,
        };
        if let Err(e) = store::log_query(&self.pool, &record).await {
            tracing::warn!(query = query_id, error = %e, "failed to log query");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_flattens_and_cuts() {
        assert_eq!(excerpt("a\n b\tc", 10), "a b c");
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
        assert_eq!(excerpt("", 3), "");
    }
}
