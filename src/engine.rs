//! The RAG engine: one handle owning the store, the index and the providers.
//!
//! [`RagEngine::open`] wires everything from a [`Config`]: it connects to
//! SQLite, runs migrations, loads the vectors of every READY document into
//! the in-memory index and settles the index strategy. Upload lives in
//! [`crate::ingest`], query and ask in [`crate::search`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;

use crate::chat::CompletionProvider;
use crate::config::Config;
use crate::db;
use crate::embedding::{EmbeddingProvider, ModelRegistry, OllamaProvider};
use crate::error::{IndexError, RagError, Result, Stage};
use crate::index::{IndexKey, IndexStrategy, VectorIndexManager};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::migrate;
use crate::models::Document;
use crate::orchestrator::EmbeddingOrchestrator;
use crate::retrieval::RetrievalEngine;
use crate::store::{self, StoreCounts};

pub struct RagEngine {
    pub(crate) config: Config,
    pub(crate) pool: SqlitePool,
    pub(crate) orchestrator: Arc<EmbeddingOrchestrator>,
    pub(crate) index: Arc<VectorIndexManager>,
    pub(crate) retrieval: RetrievalEngine,
    pub(crate) completion: Arc<dyn CompletionProvider>,
    pub(crate) metrics: MetricsRecorder,
}

/// Snapshot for `ragcli status`.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub counts: StoreCounts,
    pub strategy: IndexStrategy,
    pub indexed_vectors: usize,
    pub dimension: usize,
    pub metrics: MetricsSnapshot,
}

impl RagEngine {
    /// Open the engine against the configured Ollama endpoint.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let ollama = Arc::new(OllamaProvider::new(
            &config.ollama,
            Duration::from_secs(config.embedding.timeout_secs),
        )?);
        Self::with_providers(config, ollama.clone(), ollama).await
    }

    /// Open the engine with explicit providers.
    pub async fn with_providers(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
    ) -> anyhow::Result<Self> {
        let metrics = MetricsRecorder::init(&config.metrics);
        let registry = Arc::new(ModelRegistry::from_config(&config)?);

        let pool = db::connect(&config.db).await?;
        migrate::run_migrations(&pool).await?;

        let orchestrator = Arc::new(EmbeddingOrchestrator::new(
            embedder,
            registry,
            &config.embedding,
            metrics.clone(),
        ));
        let index = Arc::new(VectorIndexManager::new(&config.vector_index));
        let retrieval = RetrievalEngine::new(
            orchestrator.clone(),
            index.clone(),
            config.ollama.embedding_model.clone(),
            Duration::from_secs(config.rag.search_timeout_secs),
            metrics.clone(),
        );

        let engine = Self {
            config,
            pool,
            orchestrator,
            index,
            retrieval,
            completion,
            metrics,
        };
        engine.load_index().await?;
        Ok(engine)
    }

    async fn load_index(&self) -> Result<()> {
        let started = Instant::now();
        let stored = store::load_ready_vectors(&self.pool).await?;
        let items: Vec<(IndexKey, Vec<f32>)> = stored
            .into_iter()
            .map(|v| {
                (
                    IndexKey {
                        chunk_id: v.chunk_id,
                        document_id: v.document_id,
                        chunk_number: v.chunk_number,
                    },
                    v.vector,
                )
            })
            .collect();
        let count = items.len();
        self.with_index(move |index| index.upsert_batch(items)).await?;
        self.rebuild_index().await?;

        tracing::info!(
            vectors = count,
            strategy = %self.index.strategy()?,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index loaded"
        );
        Ok(())
    }

    /// Run `f` against the index on the blocking pool, bounded by
    /// `vector_index.rebuild_timeout_secs`.
    pub(crate) async fn with_index<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&VectorIndexManager) -> Result<T> + Send + 'static,
    {
        let index = self.index.clone();
        let limit = Duration::from_secs(self.config.vector_index.rebuild_timeout_secs);
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || f(index.as_ref()));

        match tokio::time::timeout(limit, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(RagError::index(
                Stage::Index,
                IndexError::Corrupted(format!("index task failed: {}", join)),
            )),
            Err(_) => Err(RagError::Timeout {
                stage: Stage::Index,
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Settle the index strategy off the async runtime.
    pub(crate) async fn rebuild_index(&self) -> Result<bool> {
        let rebuilt = self.with_index(|index| index.rebuild_if_needed()).await?;
        if rebuilt {
            self.metrics.record_rebuild();
        }
        Ok(rebuilt)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn index(&self) -> &VectorIndexManager {
        &self.index
    }

    pub fn orchestrator(&self) -> &EmbeddingOrchestrator {
        &self.orchestrator
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        store::list_documents(&self.pool).await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Document> {
        store::get_document(&self.pool, document_id)
            .await?
            .ok_or_else(|| RagError::not_found(Stage::Store, format!("document {}", document_id)))
    }

    /// Delete a document, its chunks and its index entries. Returns how many
    /// vectors left the index.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if !store::delete_document(&self.pool, document_id).await? {
            return Err(RagError::not_found(
                Stage::Store,
                format!("document {}", document_id),
            ));
        }
        let id = document_id.to_string();
        let removed = self
            .with_index(move |index| index.delete_document(&id))
            .await?;
        self.rebuild_index().await?;
        tracing::info!(document = document_id, vectors = removed, "document deleted");
        Ok(removed)
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            counts: store::counts(&self.pool).await?,
            strategy: self.index.strategy()?,
            indexed_vectors: self.index.len()?,
            dimension: self.index.dimension(),
            metrics: self.metrics.snapshot(),
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
