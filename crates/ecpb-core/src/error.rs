use thiserror::Error;

pub type Result<T> = std::result::Result<T, EcpbError>;

#[derive(Debug, Error)]
pub enum EcpbError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("metadata store error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integrity check failed for {context}: expected {expected}, got {actual}")]
    Integrity {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("dependency {prerequisite} -> {dependent} would create a cycle")]
    CycleRejected { dependent: i64, prerequisite: i64 },

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("chunk not found: {0}")]
    ChunkMissing(String),

    #[error("{0}")]
    Other(String),
}
