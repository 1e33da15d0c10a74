use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("no content left to index: {0}")]
    EmptyContent(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("cache unavailable: {0}")]
    Cache(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("query timed out after {0} ms")]
    QueryTimeout(u128),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RagError {
    /// Pipeline stage the error belongs to, as reported in build results.
    pub fn stage(&self) -> &'static str {
        match self {
            RagError::Extraction(_) => "extraction",
            RagError::EmptyContent(_) => "deduplication",
            RagError::IndexNotFound(_) => "lookup",
            RagError::Embedding(_) => "embedding",
            RagError::Generation(_) => "generation",
            RagError::Cache(_) => "cache",
            RagError::Store(_) => "vector_store",
            RagError::QueryTimeout(_) => "query",
            RagError::InvalidArgument(_) => "validation",
        }
    }
}

impl From<std::io::Error> for RagError {
    fn from(error: std::io::Error) -> Self {
        RagError::Store(error.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(error: serde_json::Error) -> Self {
        RagError::Store(format!("serialize error: {error}"))
    }
}

impl From<regex::Error> for RagError {
    fn from(error: regex::Error) -> Self {
        RagError::InvalidArgument(format!("regex error: {error}"))
    }
}
