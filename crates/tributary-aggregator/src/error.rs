//! Aggregator error types.

use thiserror::Error;

/// Failure of a metadata lookup. Never cached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("metadata source unreachable: {0}")]
    Unreachable(String),

    #[error("metadata decode error: {0}")]
    Decode(String),

    #[error("metadata lookup task failed: {0}")]
    Join(String),
}

/// A query that ended without a final outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("aggregation driver stopped before completing")]
    Interrupted,
}

impl From<tokio::task::JoinError> for EnrichmentError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}
