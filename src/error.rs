//! Typed error kinds for the engine.
//!
//! Expected conditions carry a discriminant instead of a sentinel string:
//! the orchestrator matches on [`FetchError::Status`] to decide whether a
//! page is `skipped` (401/403/404) or `error`, and the vector store
//! reports [`VectorStoreError::DimensionMismatch`] as its own kind.
//! General plumbing still flows through `anyhow`.

use thiserror::Error;

/// Error raised by a page fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("HTTP {0}")]
    Status(u16),

    /// Timeout, connection failure, or any other transport-level fault
    /// with no cached body to fall back on.
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// Statuses that are expected during open-web crawling: the page is
    /// marked `skipped` rather than `error`.
    pub fn is_skippable(&self) -> bool {
        matches!(self, FetchError::Status(401 | 403 | 404))
    }
}

/// Error raised by an embedding provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("embedding API error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("bad embedding response: {0}")]
    BadResponse(String),

    #[error("embedding transport error: {0}")]
    Transport(String),

    #[error("missing API key for embedding provider '{0}'")]
    MissingApiKey(String),
}

/// Error raised by the vector store.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// A vector's length does not match the namespace dimensionality
    /// locked in by the first upsert.
    #[error("dimension mismatch in namespace '{namespace}': expected {expected}, got {got}")]
    DimensionMismatch {
        namespace: String,
        expected: usize,
        got: usize,
    },

    #[error("vector store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("vector store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Aggregated configuration failure. Collected at startup so the user
/// sees every offending field at once, then the process exits.
#[derive(Debug, Error)]
#[error("invalid configuration:\n  {}", issues.join("\n  "))]
pub struct ConfigInvalid {
    pub issues: Vec<String>,
}
