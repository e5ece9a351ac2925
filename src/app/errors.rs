use crate::semantic::SemanticSearchError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("bookmark {0} not found")]
    NotFound(u64),

    #[error("semantic search is disabled in config")]
    SemanticDisabled,

    #[error("semantic search is unavailable: {0}")]
    SemanticUnavailable(String),

    #[error("{0}")]
    Semantic(#[from] SemanticSearchError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}
