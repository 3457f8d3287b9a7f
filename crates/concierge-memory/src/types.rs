use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
