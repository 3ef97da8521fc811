//! Error kinds shared by the codec, dispatcher and admin surface.
//!
//! Mirrors the teacher's `selenia_http::error::ErrorKind` (a flat enum that
//! maps to an HTTP status and a log level) but expressed with `thiserror`,
//! the convention the rest of the retrieval pack uses for per-crate error
//! enums (`forge_of_stories::network::{client,server}::error`, `pot_core`).

use thiserror::Error;

/// All error kinds named in spec §7.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QlbError {
    #[error("connection id shorter than required for its algorithm")]
    Truncated,

    #[error("connection id carries the reserved unroutable rotation (0b111)")]
    UnroutableCid,

    #[error("rotation id {0} has no installed configuration")]
    UnknownRotation(u8),

    #[error("server id {0} has no registered backend")]
    UnknownServerId(u16),

    #[error("backend is not admitting requests (breaker open)")]
    BackendUnavailable,

    #[error("no healthy backend is available for fallback selection")]
    NoHealthyBackend,

    #[error("upstream I/O error: {0}")]
    UpstreamIo(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("connection id's rotation bits name an algorithm whose parameters don't fit")]
    AlgorithmMismatch,
}

impl QlbError {
    /// Status code an admin/telemetry HTTP handler should return for this
    /// error, per spec §7 ("ConfigInvalid is only observable on admin
    /// endpoints as 400").
    pub fn status_code(&self) -> u16 {
        match self {
            QlbError::ConfigInvalid(_) => 400,
            QlbError::UnknownRotation(_) => 404,
            QlbError::NoHealthyBackend => 503,
            QlbError::UpstreamIo(_) | QlbError::Timeout => 502,
            _ => 500,
        }
    }

    /// True for the decode-family errors that §7 says "cause fall-through to
    /// the policy selector (not client-visible unless the selector also
    /// fails)".
    pub fn falls_through_to_policy(&self) -> bool {
        matches!(
            self,
            QlbError::Truncated
                | QlbError::UnroutableCid
                | QlbError::UnknownRotation(_)
                | QlbError::UnknownServerId(_)
                | QlbError::AlgorithmMismatch
        )
    }
}

pub type QlbResult<T> = Result<T, QlbError>;
