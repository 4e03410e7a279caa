//! Error types for togomak-engine
//!
//! Structured, user-facing failures travel as `Diagnostics`; `EngineError`
//! covers the infrastructure paths around them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Reference error: {0}")]
    Reference(String),

    #[error("Dependency cycle detected: {0}")]
    Cycle(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn execution<E: std::fmt::Display>(e: E) -> Self {
        Self::Execution(e.to_string())
    }
}
