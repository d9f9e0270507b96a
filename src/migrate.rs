//! Idempotent schema creation.

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        format TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        extracted_text_bytes INTEGER NOT NULL DEFAULT 0,
        uploaded_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        embedding_dimension INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        chunk_number INTEGER NOT NULL,
        text TEXT NOT NULL,
        token_count INTEGER NOT NULL,
        char_count INTEGER NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        embedding_model TEXT NOT NULL,
        UNIQUE(document_id, chunk_number),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queries (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        document_filter TEXT NOT NULL DEFAULT '[]',
        top_k INTEGER NOT NULL,
        min_similarity REAL NOT NULL,
        embedding_time_ms REAL NOT NULL,
        search_time_ms REAL NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS query_results (
        query_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        similarity REAL NOT NULL,
        rank INTEGER NOT NULL,
        PRIMARY KEY (query_id, rank),
        FOREIGN KEY (query_id) REFERENCES queries(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    "CREATE INDEX IF NOT EXISTS idx_queries_created_at ON queries(created_at DESC)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
