//! Engine error types

use thiserror::Error;

use kimp_core::{CoreError, PriceFeedError};

/// Startup failures. Nothing after a successful start surfaces as an error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error("Feed error: {0}")]
    Feed(#[from] PriceFeedError),

    #[error("Failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
}

pub type EngineResult<T> = Result<T, EngineError>;
