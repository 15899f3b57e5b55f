//! Crate-wide error type.
//!
//! Every fallible operation in the dispatch subsystem returns one of these
//! variants. `relay-http` maps them onto HTTP status codes; callers inside
//! the dispatcher itself treat a subset as fatal (see [`Error::is_fatal`]).

use thiserror::Error;

/// Errors produced by the registry, dispatcher, prefix map, and queues.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed event envelope or subscription-set document.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Reserved `pubsub` channel scheme used by an external publisher, or an
    /// access-key mismatch on a protected subscription-set operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No subscription set is registered under the given location.
    #[error("not found: {0}")]
    NotFound(String),

    /// A `Register` collided with an existing owner or location.
    #[error("conflict with existing set at location {0}")]
    Conflict(String),

    /// A `Replace` was ignored because `doc.version <= existing.version`.
    #[error("not modified")]
    NotModified,

    /// The caller must stop processing the current request entirely.
    #[error("aborted: {0}")]
    AbortedFatal(String),

    /// A feature/request argument could not be extracted.
    #[error("could not parse argument `{argument}`: {message}")]
    ParseArgument {
        /// Name of the offending argument.
        argument: String,
        /// Human-readable detail.
        message: String,
    },

    /// Anything else; always logged with its full cause chain.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Structural invariant violations are not recoverable; the process
    /// should not keep serving requests against corrupted state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AbortedFatal(_))
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
