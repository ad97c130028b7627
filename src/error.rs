//! Error types for workq.
//!
//! "No message available" is not an error: `reserve` and `take` return
//! `Ok(None)` on timeout. Everything here is a real failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue name collision: {requested:?} maps to a store owned by {existing:?}")]
    NameCollision { requested: String, existing: String },

    #[error("storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid message id: {0}")]
    InvalidId(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
