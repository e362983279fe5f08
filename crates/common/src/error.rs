use thiserror::Error;

/// Unified error type for Quarry crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("An unknown error occurred: {0}")]
    Unknown(String),
    #[error("Invalid physical plan: {0}")]
    InvalidPlan(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Unknown(msg.to_string())
    }
}
