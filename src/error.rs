//! Error types for hatym-rs.
//!
//! A claim that hits the per-participant cap or an exhausted pool is not an
//! error: those are ordinary [`Assignment`](crate::coordinator::Assignment)
//! outcomes. Everything here is terminal for the current attempt and is never
//! retried automatically.

use thiserror::Error;

use crate::model::{PageNumber, SessionId};

#[derive(Debug, Error)]
pub enum Error {
    /// Transport or store failure. Surfaced verbatim; the caller decides
    /// whether to retry by hand.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// The lease token is stale or mismatched, or the page is no longer
    /// assigned to this participant.
    #[error("page {page} in session {session} is not assigned to you, please claim again")]
    CapabilityRejected { session: SessionId, page: PageNumber },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("invalid page number: {0}")]
    InvalidPage(i64),

    #[error("invalid page status: {0}")]
    InvalidStatus(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    pub fn is_capability_rejected(&self) -> bool {
        matches!(self, Error::CapabilityRejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
