use axum::http::StatusCode;
use thiserror::Error;

/// Error type shared by every stage of the retrieval and answering pipeline.
#[derive(Error, Debug)]
pub enum RagError {
    /// Transport failure, non-2xx response or unparseable vector from the embedding service
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A vector whose length differs from the dimension discovered on the first call
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector store or lexical index failure
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// Chat model failure (sync or streamed)
    #[error("generation failed: {0}")]
    Generation(String),

    /// Malformed request, rejected before any retrieval work
    #[error("invalid request: {0}")]
    Validation(String),

    /// Ingestion aborted part-way through a document
    #[error("ingestion of '{doc_id}' failed at chunk {chunk_index}: {source}")]
    Ingest {
        doc_id: String,
        chunk_index: usize,
        #[source]
        source: Box<RagError>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn embedding(err: impl std::fmt::Display) -> Self {
        RagError::Embedding(format!("{err:#}"))
    }

    pub fn retrieval(err: impl std::fmt::Display) -> Self {
        RagError::Retrieval(format!("{err:#}"))
    }

    pub fn generation(err: impl std::fmt::Display) -> Self {
        RagError::Generation(format!("{err:#}"))
    }

    /// Wrap a failure that happened while ingesting `chunk_index` of `doc_id`.
    pub fn ingest(doc_id: &str, chunk_index: usize, source: RagError) -> Self {
        RagError::Ingest {
            doc_id: doc_id.to_string(),
            chunk_index,
            source: Box::new(source),
        }
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Embedding(_) | RagError::DimensionMismatch { .. } => "embedding_error",
            RagError::Retrieval(_) => "retrieval_error",
            RagError::Generation(_) => "generation_error",
            RagError::Validation(_) => "validation_error",
            RagError::Ingest { .. } => "ingest_error",
            RagError::Config(_) => "config_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RagError::Embedding(_)
            | RagError::DimensionMismatch { .. }
            | RagError::Retrieval(_)
            | RagError::Generation(_)
            | RagError::Ingest { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}
