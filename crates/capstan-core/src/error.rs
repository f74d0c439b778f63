//! Error types and result aliases for Capstan.
//!
//! The taxonomy distinguishes caller errors (`BadRequest`, `NotFound`),
//! expected coordination failures (`Conflict`), infrastructure trouble
//! (`Unavailable`, `Timeout`), violated invariants (`Fatal`) and plain
//! bugs (`Internal`). Callers retry `Conflict` and `Unavailable`; the
//! rest surface.

use std::fmt;

/// The result type used throughout Capstan.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Capstan operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller-supplied input was invalid.
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of what was wrong with the input.
        message: String,
    },

    /// The requested entity does not exist.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of entity that was looked up.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A changegroup token was stale or a compare-and-swap failed.
    ///
    /// Conflicts are a normal outcome of optimistic concurrency; callers
    /// retry from a fresh read.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting update.
        message: String,
    },

    /// The coordination service or object store is unreachable.
    #[error("unavailable: {message}")]
    Unavailable {
        /// Description of the failing dependency.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A deadline was exceeded.
    #[error("timeout: {message}")]
    Timeout {
        /// Description of the operation that timed out.
        message: String,
    },

    /// An invariant was violated (e.g. a cycle detected in a stored DAG).
    ///
    /// Fatal errors are logged and the affected run is failed; the engine
    /// itself keeps going.
    #[error("fatal: {message}")]
    Fatal {
        /// Description of the violated invariant.
        message: String,
    },

    /// A bug-class error. Details are logged, never surfaced to callers.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an unavailable error with a source cause.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates a fatal invariant-violation error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if this is a not-found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the operation can be retried without caller
    /// intervention (conflicts and infrastructure unavailability).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Unavailable { .. } | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("serialization: {err}"),
        }
    }
}
