//! Batched, concurrent embedding with retry and cancellation.
//!
//! [`EmbeddingOrchestrator::batch_embed`] turns a list of texts into vectors
//! aligned 1:1 with the input:
//!
//! - items are processed in batches of `batch_size`; within a batch, the
//!   first call runs alone so an unreachable provider aborts the job before
//!   fanning out, then the rest run on up to `workers` concurrent calls
//! - transient errors are retried with exponential backoff, then escalated
//!   to a permanent failure of that item only
//! - a vector whose length differs from the model's registered dimension
//!   aborts the whole job
//! - the cancellation token is checked before each item starts

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::embedding::{EmbeddingProvider, ModelRegistry};
use crate::error::{IndexError, ProviderError, RagError, Result, Stage};
use crate::metrics::MetricsRecorder;
use crate::progress::{BatchProgress, EtaEstimator};

/// Exponential backoff schedule for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: base, 2×base, 4×base, … capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&EmbeddingConfig> for RetryPolicy {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every item produced a vector.
    Complete,
    /// At least one item failed; the others are present.
    Partial,
    /// Stopped early by the cancellation token.
    Cancelled,
}

/// An item that could not be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub index: usize,
    pub error: ProviderError,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// One slot per input item, in input order.
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failures: Vec<ItemFailure>,
    pub status: BatchStatus,
}

impl BatchOutcome {
    pub fn completed(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

pub struct EmbeddingOrchestrator {
    provider: Arc<dyn EmbeddingProvider>,
    registry: Arc<ModelRegistry>,
    retry: RetryPolicy,
    workers: usize,
    call_timeout: Duration,
    metrics: MetricsRecorder,
}

impl EmbeddingOrchestrator {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        registry: Arc<ModelRegistry>,
        config: &EmbeddingConfig,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            provider,
            registry,
            retry: RetryPolicy::from(config),
            workers: config.workers.max(1),
            call_timeout: Duration::from_secs(config.timeout_secs),
            metrics,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Embed `items` with `model_id`. See the module docs for the rules.
    pub async fn batch_embed(
        &self,
        items: &[String],
        model_id: &str,
        batch_size: usize,
        progress: &(dyn Fn(BatchProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        if batch_size == 0 {
            return Err(RagError::validation(
                Stage::Embed,
                "batch_size must be greater than zero",
            ));
        }
        let dimension = self.registry.embedding_dimension(model_id)?;

        let total = items.len() as u64;
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; items.len()];
        let mut failures = Vec::new();
        let mut eta = EtaEstimator::default();
        let mut done = 0u64;
        let mut cancelled = false;

        for (batch_no, batch) in items.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let offset = batch_no * batch_size;

            // first call alone: an unreachable provider fails the whole job
            let started = Instant::now();
            let first = self.embed_with_retry(model_id, &batch[0]).await;
            if let Err(e) = &first {
                if e.is_unreachable() {
                    self.metrics.record_error("provider_unreachable");
                    return Err(RagError::provider(Stage::Embed, e.clone()));
                }
            }
            eta.observe(started.elapsed());
            self.place(offset, first, dimension, &mut vectors, &mut failures)?;
            done += 1;
            progress(BatchProgress {
                done,
                total,
                eta: eta.eta(total - done, self.workers),
            });

            let mut rest = stream::iter(batch.iter().enumerate().skip(1))
                .map(|(i, text)| async move {
                    if cancel.is_cancelled() {
                        return (offset + i, None);
                    }
                    let started = Instant::now();
                    let result = self.embed_with_retry(model_id, text).await;
                    (offset + i, Some((result, started.elapsed())))
                })
                .buffer_unordered(self.workers);

            while let Some((index, finished)) = rest.next().await {
                let Some((result, latency)) = finished else {
                    cancelled = true;
                    continue;
                };
                eta.observe(latency);
                self.place(index, result, dimension, &mut vectors, &mut failures)?;
                done += 1;
                progress(BatchProgress {
                    done,
                    total,
                    eta: eta.eta(total - done, self.workers),
                });
            }

            if cancelled {
                break;
            }
        }

        failures.sort_by_key(|f: &ItemFailure| f.index);
        let status = if cancelled {
            tracing::info!(done, total, "embedding cancelled");
            BatchStatus::Cancelled
        } else if failures.is_empty() {
            BatchStatus::Complete
        } else {
            BatchStatus::Partial
        };

        Ok(BatchOutcome {
            vectors,
            failures,
            status,
        })
    }

    /// Embed a single text, e.g. a query. Any failure is an error.
    pub async fn embed_one(&self, text: &str, model_id: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::validation(Stage::Embed, "text is empty"));
        }
        let dimension = self.registry.embedding_dimension(model_id)?;

        let vector = self
            .embed_with_retry(model_id, text)
            .await
            .map_err(|e| {
                self.metrics.record_error(provider_kind(&e));
                RagError::provider(Stage::Embed, e)
            })?;
        check_dimension(&vector, dimension)?;
        Ok(vector)
    }

    fn place(
        &self,
        index: usize,
        result: std::result::Result<Vec<f32>, ProviderError>,
        dimension: usize,
        vectors: &mut [Option<Vec<f32>>],
        failures: &mut Vec<ItemFailure>,
    ) -> Result<()> {
        match result {
            Ok(vector) => {
                check_dimension(&vector, dimension)?;
                vectors[index] = Some(vector);
            }
            Err(error) => {
                tracing::warn!(item = index, error = %error, "embedding failed for item");
                self.metrics.record_error(provider_kind(&error));
                failures.push(ItemFailure { index, error });
            }
        }
        Ok(())
    }

    async fn embed_with_retry(
        &self,
        model_id: &str,
        text: &str,
    ) -> std::result::Result<Vec<f32>, ProviderError> {
        let mut attempt = 0u32;
        loop {
            let call = self.provider.embed(model_id, text);
            let result = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transient(format!(
                    "embedding call timed out after {:?}",
                    self.call_timeout
                ))),
            };

            match result {
                Err(ProviderError::Transient(msg)) => {
                    if attempt >= self.retry.max_retries {
                        self.metrics.record_embed_call(attempt);
                        return Err(ProviderError::Permanent(format!(
                            "giving up after {} attempts: {}",
                            attempt + 1,
                            msg
                        )));
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        provider = self.provider.name(),
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "transient embedding error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => {
                    self.metrics.record_embed_call(attempt);
                    return other;
                }
            }
        }
    }
}

fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(RagError::index(
            Stage::Embed,
            IndexError::DimensionMismatch {
                expected,
                got: vector.len(),
            },
        ));
    }
    Ok(())
}

fn provider_kind(error: &ProviderError) -> &'static str {
    match error {
        ProviderError::Unreachable(_) => "provider_unreachable",
        ProviderError::Transient(_) => "provider_transient",
        ProviderError::Permanent(_) => "provider_permanent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelCapability, ModelKind};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    const DIM: usize = 4;

    /// Returns `[n, 1, 0, 0]` for text `"item-n"` unless a scripted
    /// response is queued for that text.
    #[derive(Default)]
    struct ScriptedProvider {
        scripts: Mutex<HashMap<String, VecDeque<std::result::Result<Vec<f32>, ProviderError>>>>,
        calls: Mutex<HashMap<String, usize>>,
        delay: Option<Duration>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedProvider {
        fn script(
            self,
            text: &str,
            responses: Vec<std::result::Result<Vec<f32>, ProviderError>>,
        ) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(text.to_string(), responses.into());
            self
        }

        fn calls_for(&self, text: &str) -> usize {
            self.calls.lock().unwrap().get(text).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn embed(
            &self,
            _model_id: &str,
            text: &str,
        ) -> std::result::Result<Vec<f32>, ProviderError> {
            let total = {
                let mut calls = self.calls.lock().unwrap();
                *calls.entry(text.to_string()).or_default() += 1;
                calls.values().sum::<usize>()
            };
            if let Some((after, token)) = &self.cancel_after {
                if total >= *after {
                    token.cancel();
                }
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(queue) = self.scripts.lock().unwrap().get_mut(text) {
                if let Some(response) = queue.pop_front() {
                    return response;
                }
            }
            let n: f32 = text
                .trim_start_matches("item-")
                .parse()
                .unwrap_or(0.0);
            Ok(vec![n, 1.0, 0.0, 0.0])
        }
    }

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new([ModelCapability {
                id: "test-embed".into(),
                kind: ModelKind::Embedding,
                dimension: DIM,
                context_window: 512,
            }])
            .unwrap(),
        )
    }

    fn orchestrator(provider: Arc<ScriptedProvider>, workers: usize) -> EmbeddingOrchestrator {
        let config = EmbeddingConfig {
            workers,
            ..EmbeddingConfig::default()
        };
        EmbeddingOrchestrator::new(provider, registry(), &config, MetricsRecorder::disabled())
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{}", i)).collect()
    }

    fn no_progress(_: BatchProgress) {}

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_and_order_is_preserved() {
        let provider = Arc::new(ScriptedProvider::default().script(
            "item-4",
            vec![
                Err(ProviderError::Transient("503".into())),
                Err(ProviderError::Transient("503".into())),
            ],
        ));
        let orch = orchestrator(provider.clone(), 3);

        let outcome = orch
            .batch_embed(&items(10), "test-embed", 32, &no_progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Complete);
        assert_eq!(outcome.vectors.len(), 10);
        for (i, v) in outcome.vectors.iter().enumerate() {
            assert_eq!(v.as_ref().unwrap()[0], i as f32);
        }
        assert_eq!(provider.calls_for("item-4"), 3);
        assert_eq!(provider.calls_for("item-5"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_follows_policy() {
        let provider = Arc::new(ScriptedProvider::default().script(
            "item-0",
            vec![
                Err(ProviderError::Transient("429".into())),
                Err(ProviderError::Transient("429".into())),
            ],
        ));
        let orch = orchestrator(provider, 1);
        let start = tokio::time::Instant::now();
        orch.embed_one("item-0", "test-embed").await.unwrap();
        // 1s + 2s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);
    }

    #[test]
    fn delay_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_only_that_item() {
        let provider = Arc::new(ScriptedProvider::default().script(
            "item-2",
            vec![Err(ProviderError::Transient("503".into())); 4],
        ));
        let orch = orchestrator(provider.clone(), 2);

        let outcome = orch
            .batch_embed(&items(5), "test-embed", 32, &no_progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Partial);
        assert_eq!(outcome.completed(), 4);
        assert!(outcome.vectors[2].is_none());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 2);
        assert!(matches!(
            outcome.failures[0].error,
            ProviderError::Permanent(_)
        ));
        assert_eq!(provider.calls_for("item-2"), 4);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::default().script(
            "item-1",
            vec![Err(ProviderError::Permanent("bad input".into()))],
        ));
        let orch = orchestrator(provider.clone(), 2);

        let outcome = orch
            .batch_embed(&items(3), "test-embed", 32, &no_progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Partial);
        assert_eq!(provider.calls_for("item-1"), 1);
        assert!(outcome.vectors[0].is_some() && outcome.vectors[2].is_some());
    }

    #[tokio::test]
    async fn unreachable_first_call_aborts_without_fan_out() {
        let provider = Arc::new(ScriptedProvider::default().script(
            "item-0",
            vec![Err(ProviderError::Unreachable("connection refused".into()))],
        ));
        let orch = orchestrator(provider.clone(), 4);

        let err = orch
            .batch_embed(&items(8), "test-embed", 32, &no_progress, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "provider_unreachable");
        assert_eq!(err.stage(), Stage::Embed);
        assert_eq!(provider.total_calls(), 1);
    }

    #[tokio::test]
    async fn wrong_dimension_is_fatal() {
        let provider = Arc::new(
            ScriptedProvider::default().script("item-3", vec![Ok(vec![1.0, 2.0])]),
        );
        let orch = orchestrator(provider, 2);

        let err = orch
            .batch_embed(&items(6), "test-embed", 32, &no_progress, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RagError::Index {
                stage: Stage::Embed,
                source: IndexError::DimensionMismatch {
                    expected: 4,
                    got: 2
                }
            }
        ));
    }

    #[tokio::test]
    async fn unknown_model_and_zero_batch_size_are_rejected() {
        let orch = orchestrator(Arc::new(ScriptedProvider::default()), 1);
        let token = CancellationToken::new();
        assert!(matches!(
            orch.batch_embed(&items(1), "nope", 8, &no_progress, &token).await,
            Err(RagError::NotFound { .. })
        ));
        assert!(matches!(
            orch.batch_embed(&items(1), "test-embed", 0, &no_progress, &token).await,
            Err(RagError::Validation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_partial_vectors() {
        let token = CancellationToken::new();
        let provider = Arc::new(ScriptedProvider {
            delay: Some(Duration::from_millis(10)),
            cancel_after: Some((3, token.clone())),
            ..ScriptedProvider::default()
        });
        let orch = orchestrator(provider.clone(), 1);

        let outcome = orch
            .batch_embed(&items(20), "test-embed", 4, &no_progress, &token)
            .await
            .unwrap();

        assert_eq!(outcome.status, BatchStatus::Cancelled);
        assert_eq!(outcome.completed(), 3);
        assert_eq!(provider.total_calls(), 3);
        assert!(outcome.vectors[..3].iter().all(Option::is_some));
        assert!(outcome.vectors[3..].iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let seen = Mutex::new(Vec::new());
        let orch = orchestrator(Arc::new(ScriptedProvider::default()), 3);
        let progress = |p: BatchProgress| seen.lock().unwrap().push(p.done);

        orch.batch_embed(&items(7), "test-embed", 3, &progress, &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.last(), Some(&7));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn embed_one_surfaces_failures() {
        let provider = Arc::new(ScriptedProvider::default().script(
            "item-9",
            vec![Err(ProviderError::Permanent("model not found".into()))],
        ));
        let orch = orchestrator(provider, 1);
        let err = orch.embed_one("item-9", "test-embed").await.unwrap_err();
        assert_eq!(err.kind(), "provider_permanent");
        assert!(orch.embed_one("   ", "test-embed").await.is_err());
    }
}
