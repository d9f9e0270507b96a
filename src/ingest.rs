//! Upload pipeline: validate → chunk → embed → persist → index.
//!
//! A document row is written as PROCESSING before any expensive work. Its
//! vectors enter the index staged and are published only after the row is
//! READY. If a later stage fails the row is kept and marked ERROR with the
//! message, its chunk rows are dropped and nothing of it stays in the index.
//! Only READY documents are searchable or reloaded at start-up.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{chunk_text_with_progress, ChunkParams};
use crate::engine::RagEngine;
use crate::error::{RagError, Result, Stage};
use crate::index::IndexKey;
use crate::metrics::UploadTimings;
use crate::models::{Chunk, Document, DocumentStatus};
use crate::orchestrator::BatchStatus;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    /// Extracted plain text.
    pub text: String,
    /// Size of the original file.
    pub size_bytes: u64,
    /// Overrides `documents.chunk_size`.
    pub chunk_size: Option<usize>,
    /// Overrides `documents.chunk_overlap_percentage`.
    pub overlap_percentage: Option<f64>,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            filename: filename.into(),
            size_bytes: text.len() as u64,
            text,
            chunk_size: None,
            overlap_percentage: None,
        }
    }

    /// Read a UTF-8 text file from disk.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} as UTF-8 text", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            filename,
            text,
            size_bytes: metadata.len(),
            chunk_size: None,
            overlap_percentage: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub document_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    pub total_tokens: usize,
    pub timings: UploadTimings,
}

/// Lower-cased extension of `filename`, or an empty string.
pub fn file_format(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Expand `paths` into the files to upload.
///
/// Directories are walked recursively and only files with a supported
/// extension are kept. Explicit file arguments are kept as given so that an
/// unsupported file is reported rather than silently skipped.
pub fn collect_files(paths: &[PathBuf], formats: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.exists() {
            anyhow::bail!("Path does not exist: {}", path.display());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(path) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let format = file_format(&name);
            if formats.iter().any(|f| f.eq_ignore_ascii_case(&format)) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        files.extend(found);
    }
    Ok(files)
}

impl RagEngine {
    /// Ingest one document. On success the document is READY and searchable.
    pub async fn upload(
        &self,
        request: UploadRequest,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        let params = match self.validate_upload(&request) {
            Ok(params) => params,
            Err(e) => {
                self.metrics.record_upload_failure(e.kind());
                return Err(e);
            }
        };

        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            filename: request.filename.clone(),
            format: file_format(&request.filename),
            size_bytes: request.size_bytes as i64,
            extracted_text_bytes: request.text.len() as i64,
            uploaded_at: now,
            modified_at: now,
            chunk_count: 0,
            total_tokens: 0,
            embedding_dimension: self.index.dimension() as i64,
            status: DocumentStatus::Processing,
            error_message: None,
        };
        store::insert_document(&self.pool, &document).await?;
        tracing::info!(
            document = %document.id,
            filename = %document.filename,
            bytes = document.size_bytes,
            "upload started"
        );

        match self
            .process(&document, &request.text, params, progress, cancel)
            .await
        {
            Ok((chunks, timings)) => {
                let total_tokens: usize = chunks.iter().map(|c| c.token_count).sum();
                self.metrics.record_upload(chunks.len(), timings);
                tracing::info!(
                    document = %document.id,
                    chunks = chunks.len(),
                    tokens = total_tokens,
                    "upload complete"
                );
                Ok(UploadReport {
                    document_id: document.id,
                    filename: document.filename,
                    status: DocumentStatus::Ready,
                    chunk_count: chunks.len(),
                    total_tokens,
                    timings,
                })
            }
            Err(e) => {
                tracing::warn!(document = %document.id, error = %e, "upload failed");
                self.metrics.record_upload_failure(e.kind());
                let id = document.id.clone();
                if let Err(cleanup) = self
                    .with_index(move |index| index.delete_document(&id))
                    .await
                {
                    tracing::warn!(document = %document.id, error = %cleanup, "index cleanup failed");
                }
                store::mark_failed(&self.pool, &document.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    fn validate_upload(&self, request: &UploadRequest) -> Result<ChunkParams> {
        let docs = &self.config.documents;
        let format = file_format(&request.filename);
        if !docs
            .supported_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&format))
        {
            return Err(RagError::validation(
                Stage::Chunk,
                format!(
                    "unsupported format '{}' for {}; supported: {}",
                    format,
                    request.filename,
                    docs.supported_formats.join(", ")
                ),
            ));
        }
        if request.size_bytes > docs.max_file_size_bytes() {
            return Err(RagError::validation(
                Stage::Chunk,
                format!(
                    "{} is {} bytes; the limit is {} MB",
                    request.filename, request.size_bytes, docs.max_file_size_mb
                ),
            ));
        }

        let params = ChunkParams::new(
            request.chunk_size.unwrap_or(docs.chunk_size),
            request
                .overlap_percentage
                .map(|p| p / 100.0)
                .unwrap_or_else(|| docs.overlap_fraction()),
        );
        params.validate()?;
        Ok(params)
    }

    async fn process(
        &self,
        document: &Document,
        text: &str,
        params: ChunkParams,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Chunk>, UploadTimings)> {
        let mut timings = UploadTimings::default();
        let model_id = self.config.ollama.embedding_model.as_str();

        let started = Instant::now();
        let chunks = chunk_text_with_progress(&document.id, text, params, |fraction| {
            progress.report(ProgressEvent::Chunking {
                document: document.filename.clone(),
                fraction,
            })
        })?;
        timings.chunk = started.elapsed();

        let started = Instant::now();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let outcome = self
            .orchestrator
            .batch_embed(
                &texts,
                model_id,
                self.config.embedding.batch_size,
                &|p| {
                    progress.report(ProgressEvent::Embedding {
                        document: document.filename.clone(),
                        progress: p,
                    })
                },
                cancel,
            )
            .await?;
        timings.embed = started.elapsed();

        match outcome.status {
            BatchStatus::Complete => {}
            BatchStatus::Cancelled => return Err(RagError::Cancelled { stage: Stage::Embed }),
            BatchStatus::Partial => {
                let failed = outcome.failures.len();
                let first = outcome.failures.into_iter().next();
                tracing::warn!(
                    document = %document.id,
                    failed,
                    total = chunks.len(),
                    "chunks failed to embed"
                );
                if let Some(failure) = first {
                    return Err(RagError::provider(Stage::Embed, failure.error));
                }
            }
        }
        let vectors: Vec<Vec<f32>> = outcome
            .vectors
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RagError::validation(Stage::Embed, "missing vectors in batch"))?;

        let started = Instant::now();
        store::store_chunks(&self.pool, &document.id, &chunks, &vectors, model_id).await?;

        progress.report(ProgressEvent::Indexing {
            document: document.filename.clone(),
            vectors: vectors.len() as u64,
        });
        let items: Vec<(IndexKey, Vec<f32>)> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                (
                    IndexKey {
                        chunk_id: chunk.id.clone(),
                        document_id: chunk.document_id.clone(),
                        chunk_number: chunk.chunk_number,
                    },
                    vector,
                )
            })
            .collect();
        self.index.stage_document(&document.id)?;
        self.with_index(move |index| index.upsert_batch(items)).await?;
        self.rebuild_index().await?;
        store::set_status(&self.pool, &document.id, DocumentStatus::Ready, None).await?;
        self.index.publish_document(&document.id)?;
        timings.index = started.elapsed();

        Ok((chunks, timings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_lowercased_extension() {
        assert_eq!(file_format("Notes.MD"), "md");
        assert_eq!(file_format("a.tar.txt"), "txt");
        assert_eq!(file_format("README"), "");
    }

    #[test]
    fn collect_walks_directories_and_keeps_explicit_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("b.md"), "b").unwrap();
        std::fs::write(nested.join("a.txt"), "a").unwrap();
        std::fs::write(nested.join("skip.pdf"), "x").unwrap();
        let explicit = dir.path().join("explicit.pdf");
        std::fs::write(&explicit, "x").unwrap();

        let formats = vec!["txt".to_string(), "md".to_string()];
        let files =
            collect_files(&[dir.path().to_path_buf(), explicit.clone()], &formats).unwrap();

        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b.md", "a.txt", "explicit.pdf"]);
    }

    #[test]
    fn collect_rejects_missing_paths() {
        let formats = vec!["txt".to_string()];
        assert!(collect_files(&[PathBuf::from("/definitely/not/here")], &formats).is_err());
    }

    #[test]
    fn request_from_path_reads_size_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "hello world").unwrap();
        let req = UploadRequest::from_path(&path).unwrap();
        assert_eq!(req.filename, "doc.txt");
        assert_eq!(req.size_bytes, 11);
        assert_eq!(req.text, "hello world");
    }
}
