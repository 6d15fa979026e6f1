use crate::head::ClusterId;

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("vector dim mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },
    #[error("index not ready")]
    NotReady,
    #[error("another structural mutation is in flight")]
    ConcurrentMutation,
    #[error("corrupt artifact: {0}")]
    Corruption(String),
    #[error("unknown cluster {0}")]
    UnknownCluster(ClusterId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VectorError>;

impl VectorError {
    pub fn config(msg: impl Into<String>) -> Self {
        VectorError::Config(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        VectorError::Corruption(msg.into())
    }
}
