//! # ragcli
//!
//! A local retrieval-augmented generation engine over plain-text documents.
//!
//! Documents are split into overlapping token-bounded chunks, embedded through
//! an Ollama-compatible provider, stored in SQLite and indexed in memory with
//! a strategy that adapts to collection size. Queries are embedded the same
//! way and answered with ranked chunks, optionally followed by a streamed
//! answer from a chat model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Chunker  │──▶│ Orchestrator  │──▶│ Index manager │◀──┐
//! │ (chunk)  │   │ retry+batch   │   │ exact/graph/  │   │
//! └──────────┘   └──────┬────────┘   │ hybrid        │   │
//!                       │            └──────┬───────┘   │
//!                       ▼                   │           │
//!                ┌─────────────┐     ┌──────┴─────┐     │
//!                │   Ollama    │     │  SQLite    │     │
//!                │ embed/chat  │     │  (store)   │     │
//!                └─────────────┘     └────────────┘     │
//!                                                       │
//!                query ─▶ retrieval ────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`chunk`] | Token-bounded overlapping chunker |
//! | [`embedding`] | Provider trait, model registry, Ollama client |
//! | [`orchestrator`] | Batched, retried, cancellable embedding |
//! | [`index`] | Scale-adaptive vector index |
//! | [`retrieval`] | Query embedding, search, thresholding, ranking |
//! | [`chat`] | Streaming completion seam |
//! | [`metrics`] | Process-wide counters and stage timings |
//! | [`engine`] | Wiring; [`ingest`] and [`search`] add upload and query |
//! | [`store`] | SQLite persistence |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod retrieval;
pub mod search;
pub mod stats;
pub mod store;

pub use engine::RagEngine;
pub use error::{RagError, Result};
