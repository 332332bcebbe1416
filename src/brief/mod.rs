//! AI brief enrichment.
//!
//! [`BriefGenerator`] talks to the chat-completions service and owns the
//! retry policy. [`BriefService`] decides which articles get a brief and
//! guarantees at most one stored brief per article.

mod generator;
mod service;

use thiserror::Error;

use crate::storage::DatabaseError;

pub use generator::{normalize_confidence, BriefGenerator, BriefInput, GeneratedBrief, MAX_PROMPT_CHARS};
pub use service::{BatchResult, BriefService};

#[derive(Debug, Error)]
pub enum BriefError {
    #[error("No API key configured for brief generation")]
    MissingApiKey,

    #[error("Invalid brief endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Brief request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Rate limited by brief service")]
    RateLimited,

    #[error("Brief service error: status {0}")]
    Server(u16),

    /// 400 and other client errors; retrying the same request cannot help
    #[error("Brief request rejected: status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid brief response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl BriefError {
    /// True if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BriefError::Timeout
            | BriefError::Network(_)
            | BriefError::RateLimited
            | BriefError::Server(_)
            | BriefError::InvalidResponse(_) => true,
            BriefError::MissingApiKey
            | BriefError::InvalidEndpoint(_)
            | BriefError::Rejected { .. }
            | BriefError::Database(_) => false,
        }
    }
}
