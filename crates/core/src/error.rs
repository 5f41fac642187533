//! Error kinds surfaced by the core (spec §7).
//!
//! Tokenizer, Scorer, and fusion are pure total functions and never fail.
//! Everything else funnels into [`ForestError`]: Store failures abort and
//! roll back the current operation, Embedder failures are recovered at the
//! Linker boundary (an affected node is committed without a vector), and
//! HistoryLedger failures are logged but never block the primary mutation.

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ForestError>;

#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous reference '{prefix}' matches {} nodes", candidates.len())]
    AmbiguousReference { prefix: String, candidates: Vec<Uuid> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl ForestError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }
}

impl From<sqlx::Error> for ForestError {
    fn from(err: sqlx::Error) -> Self {
        ForestError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for ForestError {
    fn from(err: serde_json::Error) -> Self {
        ForestError::StorageError(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_reference_reports_count() {
        let err = ForestError::AmbiguousReference {
            prefix: "abcd".into(),
            candidates: vec![Uuid::nil(), Uuid::max()],
        };
        assert_eq!(err.to_string(), "ambiguous reference 'abcd' matches 2 nodes");
    }
}
