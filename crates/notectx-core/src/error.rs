//! Error types shared by every stage of the indexing and retrieval pipeline.
//!
//! Each variant of [`Error`] corresponds to one of the boundary signals the
//! server and CLI report to callers. [`Error::code`] gives the stable,
//! machine-readable name used in JSON error envelopes and run summaries.

use serde::Serialize;
use thiserror::Error;

/// Whether a provider failure may succeed if the same request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Timeouts, connection failures, HTTP 429 and 5xx.
    Transient,
    /// Bad credentials, unknown model, malformed responses.
    Fatal,
}

/// Failure reported by an embedding backend.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Schema violation in one inbound note document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("note is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field `{0}` must not be empty")]
    Empty(&'static str),

    #[error("field `{field}` is not an RFC 3339 timestamp: {value}")]
    BadTimestamp { field: &'static str, value: String },

    #[error("duplicate note id in this run: {0}")]
    DuplicateId(String),
}

/// Top-level error for store, provider, and pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(String),

    #[error("collection '{collection}' is being written by another run")]
    Busy { collection: String },

    #[error("collection not found: {collection}")]
    NotFound { collection: String },

    #[error(
        "dimension mismatch for collection '{collection}': stored {stored}, provider produces {requested}"
    )]
    DimensionMismatch {
        collection: String,
        stored: usize,
        requested: usize,
    },

    #[error("no valid notes remain after validation")]
    NoValidNotes,

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl Error {
    /// Wrap any backend failure as a [`Error::Store`].
    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::NoValidNotes | Error::InvalidOptions(_) => "validation",
            Error::Provider(p) if p.is_transient() => "provider_transient",
            Error::Provider(_) => "provider_fatal",
            Error::Store(_) => "store",
            Error::Busy { .. } => "busy",
            Error::NotFound { .. } => "not_found",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
