//! Error types for execq.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("there is nothing to process: the queue content is empty")]
    EmptyQueue,

    #[error("queue file {} is unreadable: {reason}", path.display())]
    CorruptQueue { path: PathBuf, reason: String },

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::ItemState,
        to: crate::model::ItemState,
    },

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("status polling failed after {attempts} attempts: {message}")]
    Polling { attempts: u32, message: String },

    #[error("transient status error: {0}")]
    TransientPolling(String),

    #[error("item {identifier} still running after {elapsed_secs}s")]
    PollDeadline { identifier: u64, elapsed_secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Structural errors abort the whole run; everything else is scoped to one item.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::EmptyQueue | Error::CorruptQueue { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
