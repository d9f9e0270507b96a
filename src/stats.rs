//! `ragcli status` and `ragcli documents list` output.
//!
//! Gives a quick summary of what's indexed: document and chunk counts, the
//! active index strategy, metrics for this process and whether the
//! configured Ollama endpoint answers.

use anyhow::Result;
use std::time::Duration;

use crate::embedding::OllamaProvider;
use crate::engine::RagEngine;
use crate::metrics::StageTiming;
use crate::models::Document;
use crate::progress::format_number;

/// Run the status command: query the store and index and print a summary.
pub async fn run_status(engine: &RagEngine) -> Result<()> {
    let config = engine.config();
    let status = engine.status().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let provider = OllamaProvider::new(&config.ollama, Duration::from_secs(5))?;
    let health = match provider.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("unavailable ({})", e),
    };

    println!("ragcli status");
    println!("=============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Ollama:      {} [{}]", provider.endpoint(), health);
    println!();
    println!(
        "  Documents:   {} ({} ready, {} failed)",
        format_number(status.counts.documents as u64),
        format_number(status.counts.ready as u64),
        format_number(status.counts.failed as u64)
    );
    println!("  Chunks:      {}", format_number(status.counts.chunks as u64));
    println!(
        "  Vectors:     {} x {} dims",
        format_number(status.indexed_vectors as u64),
        status.dimension
    );
    println!("  Strategy:    {}", status.strategy);
    println!("  Queries:     {}", format_number(status.counts.queries as u64));

    if engine.metrics().is_enabled() {
        let m = &status.metrics;
        println!();
        println!("  This process:");
        println!(
            "    uploads {}  failed {}  chunks {}  queries {}",
            m.uploads_processed, m.uploads_failed, m.chunks_created, m.queries_processed
        );
        println!(
            "    embed calls {}  retries {}  index rebuilds {}",
            m.embed_calls, m.embed_retries, m.index_rebuilds
        );
        print_timing("upload chunk", &m.upload_chunk);
        print_timing("upload embed", &m.upload_embed);
        print_timing("upload index", &m.upload_index);
        print_timing("query embed", &m.query_embed);
        print_timing("query search", &m.query_search);
        if m.similarity_samples > 0 {
            println!("    avg similarity {:.3}", m.avg_similarity());
        }
        for (kind, count) in &m.errors_by_kind {
            println!("    errors[{}] {}", kind, count);
        }
    }

    println!();
    Ok(())
}

fn print_timing(label: &str, timing: &StageTiming) {
    if timing.count > 0 {
        println!("    {:<14} avg {:.1} ms over {}", label, timing.avg_ms(), timing.count);
    }
}

/// Print documents as a table, newest first.
pub fn print_documents(documents: &[Document]) {
    if documents.is_empty() {
        println!("No documents.");
        return;
    }

    println!(
        "{:<36}  {:<10}  {:>6}  {:>8}  {:>10}  {:<14}  FILENAME",
        "ID", "STATUS", "CHUNKS", "TOKENS", "SIZE", "UPLOADED"
    );
    for doc in documents {
        println!(
            "{:<36}  {:<10}  {:>6}  {:>8}  {:>10}  {:<14}  {}",
            doc.id,
            doc.status,
            doc.chunk_count,
            doc.total_tokens,
            format_bytes(doc.size_bytes.max(0) as u64),
            format_ts_relative(doc.uploaded_at.timestamp()),
            doc.filename
        );
        if let Some(err) = &doc.error_message {
            println!("    error: {}", err);
        }
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
