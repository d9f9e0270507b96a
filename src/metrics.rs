//! In-process metrics for uploads and queries.
//!
//! [`MetricsRecorder`] is a cheap, cloneable handle around a
//! `tokio::sync::watch` channel. Components record into it; the CLI reads a
//! [`MetricsSnapshot`] or subscribes for live updates. There are no global
//! statics: every recorder comes from [`MetricsRecorder::init`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::MetricsConfig;

/// Running total for one pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTiming {
    pub count: u64,
    pub total_ms: f64,
}

impl StageTiming {
    fn add(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uploads_processed: u64,
    pub uploads_failed: u64,
    pub chunks_created: u64,
    pub queries_processed: u64,
    pub embed_calls: u64,
    pub embed_retries: u64,
    pub index_rebuilds: u64,
    pub upload_chunk: StageTiming,
    pub upload_embed: StageTiming,
    pub upload_index: StageTiming,
    pub query_embed: StageTiming,
    pub query_search: StageTiming,
    pub similarity_total: f64,
    pub similarity_samples: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Mean similarity of every returned retrieval hit.
    pub fn avg_similarity(&self) -> f64 {
        if self.similarity_samples == 0 {
            0.0
        } else {
            self.similarity_total / self.similarity_samples as f64
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_kind.values().sum()
    }
}

/// Stage timings of one successful upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UploadTimings {
    pub chunk: Duration,
    pub embed: Duration,
    pub index: Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    tx: Arc<watch::Sender<MetricsSnapshot>>,
    enabled: bool,
}

impl MetricsRecorder {
    pub fn init(config: &MetricsConfig) -> Self {
        let (tx, _rx) = watch::channel(MetricsSnapshot::default());
        Self {
            tx: Arc::new(tx),
            enabled: config.enabled,
        }
    }

    /// A recorder that ignores everything.
    pub fn disabled() -> Self {
        Self::init(&MetricsConfig { enabled: false })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn reset(&self) {
        self.tx.send_replace(MetricsSnapshot::default());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        if self.enabled {
            self.tx.send_modify(f);
        }
    }

    pub fn record_upload(&self, chunks: usize, timings: UploadTimings) {
        self.update(|m| {
            m.uploads_processed += 1;
            m.chunks_created += chunks as u64;
            m.upload_chunk.add(timings.chunk);
            m.upload_embed.add(timings.embed);
            m.upload_index.add(timings.index);
        });
    }

    pub fn record_upload_failure(&self, kind: &str) {
        self.update(|m| {
            m.uploads_failed += 1;
            *m.errors_by_kind.entry(kind.to_string()).or_default() += 1;
        });
    }

    pub fn record_query(&self, embed: Duration, search: Duration, similarities: &[f32]) {
        self.update(|m| {
            m.queries_processed += 1;
            m.query_embed.add(embed);
            m.query_search.add(search);
            for s in similarities {
                m.similarity_total += f64::from(*s);
                m.similarity_samples += 1;
            }
        });
    }

    pub fn record_embed_call(&self, retries: u32) {
        self.update(|m| {
            m.embed_calls += 1;
            m.embed_retries += u64::from(retries);
        });
    }

    pub fn record_rebuild(&self) {
        self.update(|m| m.index_rebuilds += 1);
    }

    pub fn record_error(&self, kind: &str) {
        self.update(|m| *m.errors_by_kind.entry(kind.to_string()).or_default() += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn records_upload_averages() {
        let metrics = MetricsRecorder::init(&MetricsConfig::default());
        metrics.record_upload(
            3,
            UploadTimings {
                chunk: ms(10),
                embed: ms(100),
                index: ms(4),
            },
        );
        metrics.record_upload(
            5,
            UploadTimings {
                chunk: ms(30),
                embed: ms(300),
                index: ms(6),
            },
        );
        let snap = metrics.snapshot();
        assert_eq!(snap.uploads_processed, 2);
        assert_eq!(snap.chunks_created, 8);
        assert!((snap.upload_chunk.avg_ms() - 20.0).abs() < 1e-6);
        assert!((snap.upload_embed.avg_ms() - 200.0).abs() < 1e-6);
        assert!((snap.upload_index.avg_ms() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn records_query_similarity_and_errors() {
        let metrics = MetricsRecorder::init(&MetricsConfig::default());
        metrics.record_query(ms(5), ms(1), &[0.9, 0.7]);
        metrics.record_query(ms(5), ms(1), &[]);
        metrics.record_error("timeout");
        metrics.record_error("timeout");
        metrics.record_upload_failure("provider_unreachable");

        let snap = metrics.snapshot();
        assert_eq!(snap.queries_processed, 2);
        assert!((snap.avg_similarity() - 0.8).abs() < 1e-6);
        assert_eq!(snap.errors_by_kind["timeout"], 2);
        assert_eq!(snap.uploads_failed, 1);
        assert_eq!(snap.total_errors(), 3);
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = MetricsRecorder::init(&MetricsConfig::default());
        metrics.record_embed_call(2);
        metrics.record_rebuild();
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn disabled_recorder_is_noop() {
        let metrics = MetricsRecorder::disabled();
        metrics.record_embed_call(1);
        metrics.record_error("index");
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn clones_share_state_and_notify_subscribers() {
        let metrics = MetricsRecorder::init(&MetricsConfig::default());
        let mut rx = metrics.subscribe();
        let clone = metrics.clone();
        clone.record_embed_call(0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().embed_calls, 1);
        assert_eq!(metrics.snapshot().embed_calls, 1);
    }
}
