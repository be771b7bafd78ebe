//! Error types for leaseq.

use thiserror::Error;

use crate::model::QueueStats;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// Strict-mode claim against a queue with nothing claimable.
    /// Carries a stats snapshot taken at the moment of the failed claim.
    #[error("nothing to claim in queue {queue} ({stats})")]
    Drained { queue: String, stats: QueueStats },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
