//! Typed error kinds for the OEE core (spec.md §7). Top-level orchestration
//! in `main.rs`/`supervisor.rs` wraps these with `anyhow::Context` the way
//! the teacher wraps `db`/`config` failures; everywhere else propagates
//! `OeeError` directly with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OeeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("reference data source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OeeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type OeeResult<T> = Result<T, OeeError>;
