//! SQLite persistence for documents, chunk vectors and the query log.
//!
//! The in-memory index is derived state: it is rebuilt from the `chunks`
//! table of READY documents at start-up, so every write that must survive a
//! restart goes through here first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result, Stage};
use crate::models::{Chunk, Document, DocumentStatus, QueryRecord};

/// A persisted chunk vector, as loaded into the index.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_number: i64,
    pub vector: Vec<f32>,
}

/// Chunk text joined with its document, for display.
#[derive(Debug, Clone)]
pub struct ChunkText {
    pub filename: String,
    pub chunk_number: i64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub documents: i64,
    pub ready: i64,
    pub failed: i64,
    pub chunks: i64,
    pub queries: i64,
}

pub async fn insert_document(pool: &SqlitePool, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, filename, format, size_bytes, extracted_text_bytes,
            uploaded_at, modified_at, chunk_count, total_tokens, embedding_dimension,
            status, error_message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.filename)
    .bind(&doc.format)
    .bind(doc.size_bytes)
    .bind(doc.extracted_text_bytes)
    .bind(doc.uploaded_at.timestamp())
    .bind(doc.modified_at.timestamp())
    .bind(doc.chunk_count)
    .bind(doc.total_tokens)
    .bind(doc.embedding_dimension)
    .bind(doc.status.as_str())
    .bind(&doc.error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write a document's chunks and vectors in one transaction and record the
/// totals on the document row. The document stays PROCESSING.
pub async fn store_chunks(
    pool: &SqlitePool,
    document_id: &str,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    embedding_model: &str,
) -> Result<()> {
    if chunks.len() != vectors.len() {
        return Err(RagError::validation(
            Stage::Store,
            format!("{} chunks but {} vectors", chunks.len(), vectors.len()),
        ));
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors) {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_number, text, token_count, char_count,
                start_offset, end_offset, hash, embedding, embedding_model)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_number)
        .bind(&chunk.text)
        .bind(chunk.token_count as i64)
        .bind(chunk.char_count() as i64)
        .bind(chunk.start_offset as i64)
        .bind(chunk.end_offset as i64)
        .bind(&chunk.hash)
        .bind(vec_to_blob(vector))
        .bind(embedding_model)
        .execute(&mut *tx)
        .await?;
    }

    let total_tokens: i64 = chunks.iter().map(|c| c.token_count as i64).sum();
    sqlx::query(
        "UPDATE documents SET chunk_count = ?, total_tokens = ?, modified_at = ? WHERE id = ?",
    )
    .bind(chunks.len() as i64)
    .bind(total_tokens)
    .bind(Utc::now().timestamp())
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn set_status(
    pool: &SqlitePool,
    document_id: &str,
    status: DocumentStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE documents SET status = ?, error_message = ?, modified_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(Utc::now().timestamp())
    .bind(document_id)
    .execute(pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(RagError::not_found(
            Stage::Store,
            format!("document {}", document_id),
        ));
    }
    Ok(())
}

/// Mark a document ERROR and drop the chunk rows a failed upload left behind.
pub async fn mark_failed(pool: &SqlitePool, document_id: &str, error_message: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    let updated = sqlx::query(
        "UPDATE documents SET status = ?, error_message = ?, chunk_count = 0, total_tokens = 0, \
         modified_at = ? WHERE id = ?",
    )
    .bind(DocumentStatus::Error.as_str())
    .bind(error_message)
    .bind(Utc::now().timestamp())
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(RagError::not_found(
            Stage::Store,
            format!("document {}", document_id),
        ));
    }
    tx.commit().await?;
    Ok(())
}

/// Delete a document and (by cascade) its chunks. Returns whether it existed.
pub async fn delete_document(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(deleted.rows_affected() > 0)
}

pub async fn get_document(pool: &SqlitePool, document_id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(document_from_row).transpose()
}

/// All documents, newest first.
pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents ORDER BY uploaded_at DESC, id ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(document_from_row).collect()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let status = status
        .parse::<DocumentStatus>()
        .map_err(|e| RagError::validation(Stage::Store, e))?;
    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        format: row.get("format"),
        size_bytes: row.get("size_bytes"),
        extracted_text_bytes: row.get("extracted_text_bytes"),
        uploaded_at: timestamp(row.get("uploaded_at")),
        modified_at: timestamp(row.get("modified_at")),
        chunk_count: row.get("chunk_count"),
        total_tokens: row.get("total_tokens"),
        embedding_dimension: row.get("embedding_dimension"),
        status,
        error_message: row.get("error_message"),
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Vectors of every READY document, in document then chunk order.
pub async fn load_ready_vectors(pool: &SqlitePool) -> Result<Vec<StoredVector>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.chunk_number, c.embedding
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE d.status = 'READY'
        ORDER BY c.document_id, c.chunk_number
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            StoredVector {
                chunk_id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_number: row.get("chunk_number"),
                vector: blob_to_vec(&blob),
            }
        })
        .collect())
}

/// Text and source filename for each of `chunk_ids` that still exists.
pub async fn chunk_texts(
    pool: &SqlitePool,
    chunk_ids: &[String],
) -> Result<HashMap<String, ChunkText>> {
    let mut texts = HashMap::with_capacity(chunk_ids.len());
    for id in chunk_ids {
        let row = sqlx::query(
            r#"
            SELECT d.filename, c.chunk_number, c.text
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = row {
            texts.insert(
                id.clone(),
                ChunkText {
                    filename: row.get("filename"),
                    chunk_number: row.get("chunk_number"),
                    text: row.get("text"),
                },
            );
        }
    }
    Ok(texts)
}

pub async fn log_query(pool: &SqlitePool, record: &QueryRecord) -> Result<()> {
    let filter = serde_json::to_string(&record.document_filter)
        .map_err(|e| RagError::validation(Stage::Store, e.to_string()))?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO queries (id, text, document_filter, top_k, min_similarity,
            embedding_time_ms, search_time_ms, status, error_message, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.text)
    .bind(filter)
    .bind(record.top_k as i64)
    .bind(record.min_similarity as f64)
    .bind(record.embedding_time_ms)
    .bind(record.search_time_ms)
    .bind(record.status.as_str())
    .bind(&record.error_message)
    .bind(Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    for result in &record.results {
        sqlx::query(
            "INSERT INTO query_results (query_id, chunk_id, similarity, rank) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&result.chunk_id)
        .bind(result.similarity as f64)
        .bind(result.rank as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn counts(pool: &SqlitePool) -> Result<StoreCounts> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM documents) AS documents,
            (SELECT COUNT(*) FROM documents WHERE status = 'READY') AS ready,
            (SELECT COUNT(*) FROM documents WHERE status = 'ERROR') AS failed,
            (SELECT COUNT(*) FROM chunks) AS chunks,
            (SELECT COUNT(*) FROM queries) AS queries
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(StoreCounts {
        documents: row.get("documents"),
        ready: row.get("ready"),
        failed: row.get("failed"),
        chunks: row.get("chunks"),
        queries: row.get("queries"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkParams};
    use crate::config::DbConfig;
    use crate::models::{QueryStatus, RetrievedChunk};

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&DbConfig {
            path: dir.path().join("store.sqlite"),
        })
        .await
        .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    fn document(id: &str) -> Document {
        let now = Utc::now();
        Document {
            id: id.into(),
            filename: format!("{}.txt", id),
            format: "txt".into(),
            size_bytes: 42,
            extracted_text_bytes: 42,
            uploaded_at: now,
            modified_at: now,
            chunk_count: 0,
            total_tokens: 0,
            embedding_dimension: 2,
            status: DocumentStatus::Processing,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn only_ready_documents_are_loaded() {
        let (_dir, pool) = pool().await;
        for id in ["a", "b"] {
            insert_document(&pool, &document(id)).await.unwrap();
            let chunks =
                chunk_text(id, "one two three four five", ChunkParams::new(2, 0.0)).unwrap();
            let vectors: Vec<Vec<f32>> = chunks.iter().map(|_| vec![1.0, 0.5]).collect();
            store_chunks(&pool, id, &chunks, &vectors, "m").await.unwrap();
        }
        set_status(&pool, "a", DocumentStatus::Ready, None).await.unwrap();
        set_status(&pool, "b", DocumentStatus::Error, Some("boom"))
            .await
            .unwrap();

        let loaded = load_ready_vectors(&pool).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.iter().all(|v| v.document_id == "a"));
        assert_eq!(loaded[2].chunk_number, 2);
        assert_eq!(loaded[0].vector, vec![1.0, 0.5]);

        let doc = get_document(&pool, "a").await.unwrap().unwrap();
        assert_eq!(doc.chunk_count, 3);
        assert_eq!(doc.total_tokens, 5);
        let failed = get_document(&pool, "b").await.unwrap().unwrap();
        assert_eq!(failed.status, DocumentStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let (_dir, pool) = pool().await;
        insert_document(&pool, &document("a")).await.unwrap();
        let chunks = chunk_text("a", "alpha beta", ChunkParams::new(8, 0.0)).unwrap();
        store_chunks(&pool, "a", &chunks, &[vec![0.0, 1.0]], "m")
            .await
            .unwrap();

        assert!(delete_document(&pool, "a").await.unwrap());
        assert!(!delete_document(&pool, "a").await.unwrap());
        let c = counts(&pool).await.unwrap();
        assert_eq!(c.documents, 0);
        assert_eq!(c.chunks, 0);
    }

    #[tokio::test]
    async fn mark_failed_drops_chunk_rows() {
        let (_dir, pool) = pool().await;
        insert_document(&pool, &document("a")).await.unwrap();
        let chunks = chunk_text("a", "one two three four", ChunkParams::new(2, 0.0)).unwrap();
        let vectors: Vec<Vec<f32>> = chunks.iter().map(|_| vec![1.0, 0.0]).collect();
        store_chunks(&pool, "a", &chunks, &vectors, "m").await.unwrap();
        assert_eq!(counts(&pool).await.unwrap().chunks, 2);

        mark_failed(&pool, "a", "rebuild timed out").await.unwrap();
        let c = counts(&pool).await.unwrap();
        assert_eq!(c.chunks, 0);
        assert_eq!(c.failed, 1);
        let doc = get_document(&pool, "a").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert_eq!(doc.chunk_count, 0);
        assert_eq!(doc.error_message.as_deref(), Some("rebuild timed out"));

        assert!(matches!(
            mark_failed(&pool, "ghost", "x").await,
            Err(RagError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn mismatched_vectors_are_rejected() {
        let (_dir, pool) = pool().await;
        insert_document(&pool, &document("a")).await.unwrap();
        let chunks = chunk_text("a", "alpha beta", ChunkParams::new(8, 0.0)).unwrap();
        let err = store_chunks(&pool, "a", &chunks, &[], "m").await.unwrap_err();
        assert!(matches!(err, RagError::Validation { .. }));
    }

    #[tokio::test]
    async fn set_status_on_missing_document() {
        let (_dir, pool) = pool().await;
        let err = set_status(&pool, "ghost", DocumentStatus::Ready, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn query_log_and_texts() {
        let (_dir, pool) = pool().await;
        insert_document(&pool, &document("a")).await.unwrap();
        let chunks = chunk_text("a", "alpha beta", ChunkParams::new(8, 0.0)).unwrap();
        store_chunks(&pool, "a", &chunks, &[vec![0.0, 1.0]], "m")
            .await
            .unwrap();

        let record = QueryRecord {
            id: "q1".into(),
            text: "alpha?".into(),
            document_filter: vec!["a".into()],
            top_k: 3,
            min_similarity: 0.2,
            embedding_time_ms: 1.5,
            search_time_ms: 0.1,
            status: QueryStatus::Success,
            error_message: None,
            results: vec![RetrievedChunk {
                rank: 1,
                chunk_id: chunks[0].id.clone(),
                document_id: "a".into(),
                chunk_number: 0,
                similarity: 0.9,
            }],
        };
        log_query(&pool, &record).await.unwrap();
        assert_eq!(counts(&pool).await.unwrap().queries, 1);

        let texts = chunk_texts(&pool, &[chunks[0].id.clone(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[&chunks[0].id].text, "alpha beta");
        assert_eq!(texts[&chunks[0].id].filename, "a.txt");
    }
}
