//! Error taxonomy for the RAG engine.
//!
//! Every surfaced [`RagError`] names the pipeline [`Stage`] that failed so the
//! surrounding layer (CLI, API) can report where things went wrong. The CLI
//! wraps these in `anyhow` for display.

use std::fmt;
use std::time::Duration;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Chunk,
    Embed,
    Index,
    Search,
    Generate,
    Store,
    Config,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Index => "index",
            Stage::Search => "search",
            Stage::Generate => "generate",
            Stage::Store => "store",
            Stage::Config => "config",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an embedding or completion provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The provider endpoint could not be reached at all.
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    /// Worth retrying: rate limits, 5xx responses, timeouts.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Retrying will not help: unknown model, malformed request or response.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_))
    }
}

/// Structural problems with vectors or the index itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector for {0} has zero norm and cannot be normalized")]
    ZeroVector(String),

    #[error("index corrupted: {0}")]
    Corrupted(String),
}

/// The engine's error type.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("[{stage}] validation failed: {message}")]
    Validation { stage: Stage, message: String },

    #[error("[{stage}] {source}")]
    Provider {
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    #[error("[{stage}] {source}")]
    Index {
        stage: Stage,
        #[source]
        source: IndexError,
    },

    #[error("[{stage}] not found: {what}")]
    NotFound { stage: Stage, what: String },

    #[error("[{stage}] timed out after {elapsed:?}")]
    Timeout { stage: Stage, elapsed: Duration },

    #[error("[{stage}] cancelled")]
    Cancelled { stage: Stage },

    #[error("[store] database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("[config] {0}")]
    Config(String),
}

impl RagError {
    pub fn validation(stage: Stage, message: impl Into<String>) -> Self {
        RagError::Validation {
            stage,
            message: message.into(),
        }
    }

    pub fn provider(stage: Stage, source: ProviderError) -> Self {
        RagError::Provider { stage, source }
    }

    pub fn index(stage: Stage, source: IndexError) -> Self {
        RagError::Index { stage, source }
    }

    pub fn not_found(stage: Stage, what: impl Into<String>) -> Self {
        RagError::NotFound {
            stage,
            what: what.into(),
        }
    }

    /// Stage the error is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            RagError::Validation { stage, .. }
            | RagError::Provider { stage, .. }
            | RagError::Index { stage, .. }
            | RagError::NotFound { stage, .. }
            | RagError::Timeout { stage, .. }
            | RagError::Cancelled { stage } => *stage,
            RagError::Storage(_) => Stage::Store,
            RagError::Config(_) => Stage::Config,
        }
    }

    /// Stable label used for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation { .. } => "validation",
            RagError::Provider {
                source: ProviderError::Unreachable(_),
                ..
            } => "provider_unreachable",
            RagError::Provider {
                source: ProviderError::Transient(_),
                ..
            } => "provider_transient",
            RagError::Provider {
                source: ProviderError::Permanent(_),
                ..
            } => "provider_permanent",
            RagError::Index { .. } => "index",
            RagError::NotFound { .. } => "not_found",
            RagError::Timeout { .. } => "timeout",
            RagError::Cancelled { .. } => "cancelled",
            RagError::Storage(_) => "storage",
            RagError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_stage() {
        let err = RagError::validation(Stage::Chunk, "text is empty");
        assert_eq!(err.to_string(), "[chunk] validation failed: text is empty");
        assert_eq!(err.stage(), Stage::Chunk);
    }

    #[test]
    fn provider_kinds_are_distinct() {
        let unreachable =
            RagError::provider(Stage::Embed, ProviderError::Unreachable("refused".into()));
        let permanent = RagError::provider(Stage::Embed, ProviderError::Permanent("404".into()));
        assert_eq!(unreachable.kind(), "provider_unreachable");
        assert_eq!(permanent.kind(), "provider_permanent");
        assert!(unreachable.to_string().starts_with("[embed]"));
    }

    #[test]
    fn index_error_message() {
        let err = RagError::index(
            Stage::Index,
            IndexError::DimensionMismatch {
                expected: 768,
                got: 384,
            },
        );
        assert_eq!(
            err.to_string(),
            "[index] dimension mismatch: expected 768, got 384"
        );
        assert_eq!(err.kind(), "index");
    }
}
