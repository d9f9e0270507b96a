//! # ragcli
//!
//! Command-line front end for the RAG engine: upload text documents, search
//! them by meaning, and ask questions answered from the retrieved passages.
//!
//! ## Usage
//!
//! ```bash
//! ragcli --config ./config/ragcli.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragcli init` | Create the SQLite database and run schema migrations |
//! | `ragcli upload <paths>...` | Chunk, embed and index files or directories |
//! | `ragcli search "<query>"` | Rank stored chunks by similarity |
//! | `ragcli ask "<question>"` | Retrieve context and stream an answer |
//! | `ragcli documents list` | List uploaded documents |
//! | `ragcli documents delete <id>` | Delete a document and its vectors |
//! | `ragcli status` | Counts, index strategy, metrics and provider health |
//! | `ragcli models` | Registered models and models installed in Ollama |

use anyhow::bail;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use ragcli::config::{self, Config};
use ragcli::db;
use ragcli::embedding::{ModelRegistry, OllamaProvider};
use ragcli::engine::RagEngine;
use ragcli::ingest::{collect_files, UploadRequest};
use ragcli::logging;
use ragcli::migrate;
use ragcli::progress::ProgressMode;
use ragcli::search::{excerpt, QueryRequest};
use ragcli::stats;

/// ragcli: local retrieval-augmented search over your text files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Only `[db] path` is required; everything else has defaults.
#[derive(Parser)]
#[command(name = "ragcli", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragcli.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Upload text files. Directories are walked recursively.
    Upload {
        /// Files or directories to upload.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Target tokens per chunk (overrides `documents.chunk_size`).
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Overlap between consecutive chunks, in percent.
        #[arg(long)]
        overlap: Option<f64>,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search stored chunks by similarity.
    Search {
        query: String,

        #[command(flatten)]
        retrieval: RetrievalArgs,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve context and stream an answer from the chat model.
    ///
    /// Ctrl-C stops the answer.
    Ask {
        question: String,

        #[command(flatten)]
        retrieval: RetrievalArgs,
    },

    /// Manage uploaded documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Show counts, index strategy, metrics and provider health.
    Status,

    /// List registered models and the models installed in Ollama.
    Models,
}

#[derive(clap::Args)]
struct RetrievalArgs {
    /// Maximum number of results (overrides `rag.top_k`).
    #[arg(long)]
    top_k: Option<usize>,

    /// Minimum cosine similarity (overrides `rag.min_similarity_score`).
    #[arg(long)]
    min_similarity: Option<f32>,

    /// Restrict to a document id. Repeatable.
    #[arg(long = "document")]
    documents: Vec<String>,
}

impl RetrievalArgs {
    fn into_request(self, query: String) -> QueryRequest {
        QueryRequest {
            query,
            top_k: self.top_k,
            min_similarity: self.min_similarity,
            document_filter: self.documents,
        }
    }
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List documents, newest first.
    List,
    /// Delete a document, its chunks and its vectors.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Upload {
            paths,
            chunk_size,
            overlap,
            progress,
        } => {
            run_upload(cfg, paths, chunk_size, overlap, progress).await?;
        }
        Commands::Search {
            query,
            retrieval,
            json,
        } => {
            let engine = RagEngine::open(cfg).await?;
            let response = engine.query(retrieval.into_request(query)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.hits.is_empty() {
                println!("No results.");
            } else {
                for hit in &response.hits {
                    println!(
                        "{}. [{:.3}] {} #{}",
                        hit.rank, hit.similarity, hit.filename, hit.chunk_number
                    );
                    println!("    excerpt: \"{}\"", excerpt(&hit.text, 240));
                    println!("    document: {}", hit.document_id);
                    println!();
                }
            }
            engine.close().await;
        }
        Commands::Ask {
            question,
            retrieval,
        } => {
            run_ask(cfg, retrieval.into_request(question)).await?;
        }
        Commands::Documents { action } => {
            let engine = RagEngine::open(cfg).await?;
            match action {
                DocumentsAction::List => {
                    stats::print_documents(&engine.list_documents().await?);
                }
                DocumentsAction::Delete { id } => {
                    let removed = engine.delete_document(&id).await?;
                    println!("Deleted document {} ({} vectors).", id, removed);
                }
            }
            engine.close().await;
        }
        Commands::Status => {
            let engine = RagEngine::open(cfg).await?;
            stats::run_status(&engine).await?;
            engine.close().await;
        }
        Commands::Models => {
            run_models(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_upload(
    cfg: Config,
    paths: Vec<PathBuf>,
    chunk_size: Option<usize>,
    overlap: Option<f64>,
    progress: Option<ProgressMode>,
) -> anyhow::Result<()> {
    let files = collect_files(&paths, &cfg.documents.supported_formats)?;
    if files.is_empty() {
        bail!("No supported files found (formats: {})", cfg.documents.supported_formats.join(", "));
    }

    let engine = RagEngine::open(cfg).await?;
    let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
    let cancel = cancel_on_ctrl_c();

    let mut failed = 0usize;
    for path in &files {
        if cancel.is_cancelled() {
            break;
        }
        let mut request = UploadRequest::from_path(path)?;
        request.chunk_size = chunk_size;
        request.overlap_percentage = overlap;

        match engine.upload(request, reporter.as_ref(), &cancel).await {
            Ok(report) => {
                println!(
                    "uploaded {}  id {}  chunks {}  tokens {}  ({:.1}s)",
                    report.filename,
                    report.document_id,
                    report.chunk_count,
                    report.total_tokens,
                    (report.timings.chunk + report.timings.embed + report.timings.index)
                        .as_secs_f64()
                );
            }
            Err(e) => {
                failed += 1;
                eprintln!("error: {}: {}", path.display(), e);
            }
        }
    }
    engine.close().await;

    if failed > 0 {
        bail!("{} of {} uploads failed", failed, files.len());
    }
    Ok(())
}

async fn run_ask(cfg: Config, request: QueryRequest) -> anyhow::Result<()> {
    let engine = RagEngine::open(cfg).await?;
    let cancel = cancel_on_ctrl_c();
    let mut answer = engine.ask(request, &cancel).await?;

    if answer.query.hits.is_empty() {
        eprintln!("(no passages above the similarity threshold)");
    }
    for hit in &answer.query.hits {
        eprintln!(
            "[{}] {} #{} ({:.3})",
            hit.rank, hit.filename, hit.chunk_number, hit.similarity
        );
    }
    eprintln!();

    let mut stdout = std::io::stdout();
    while let Some(token) = answer.tokens.next().await {
        let token = token?;
        stdout.write_all(token.as_bytes())?;
        stdout.flush()?;
    }
    println!();
    if cancel.is_cancelled() {
        eprintln!("(cancelled)");
    }

    engine.close().await;
    Ok(())
}

async fn run_models(cfg: &Config) -> anyhow::Result<()> {
    let registry = ModelRegistry::from_config(cfg)?;
    println!("{:<32}  {:<10}  {:>9}  {:>8}", "MODEL", "KIND", "DIMENSION", "CONTEXT");
    for model in registry.iter() {
        let dimension = if model.dimension > 0 {
            model.dimension.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<32}  {:<10}  {:>9}  {:>8}",
            model.id,
            model.kind.to_string(),
            dimension,
            model.context_window
        );
    }

    let provider = OllamaProvider::new(&cfg.ollama, Duration::from_secs(10))?;
    println!();
    match provider.list_models().await {
        Ok(installed) => {
            println!("Installed in Ollama ({}):", provider.endpoint());
            for name in &installed {
                let mark = if registry.get(base_name(name)).is_some() {
                    "*"
                } else {
                    " "
                };
                println!("  {} {}", mark, name);
            }
            for model in registry.iter() {
                if !installed.iter().any(|n| base_name(n) == model.id) {
                    println!("  missing: {} (run `ollama pull {}`)", model.id, model.id);
                }
            }
        }
        Err(e) => {
            eprintln!("Ollama at {} is unavailable: {}", provider.endpoint(), e);
        }
    }
    Ok(())
}

/// Ollama reports `name:latest` for untagged pulls.
fn base_name(name: &str) -> &str {
    name.strip_suffix(":latest").unwrap_or(name)
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

