use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Failed(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("index at {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("cannot build an index from an empty corpus")]
    EmptyCorpus,

    #[error("vector dimension mismatch: index uses {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index was built with embedding model {index}, serving with {embedder}")]
    ModelMismatch { index: String, embedder: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of the language-model collaborator, used for both query
/// reformulation and answer generation.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("model api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model api rate limited the request: {0}")]
    RateLimited(String),

    #[error("model api rejected the credentials: {0}")]
    Unauthorized(String),

    #[error("model call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("failed to parse model response: {0}")]
    Parse(String),

    #[error("model not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("downstream model error: {0}")]
    Downstream(#[from] ModelError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("question is empty")]
    EmptyQuestion,
}

/// Failures while turning a folder of PDFs into a saved index.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl RetrievalError {
    /// True when the failure came from the language model and the turn can be
    /// retried by the user.
    pub fn is_downstream(&self) -> bool {
        matches!(self, Self::Downstream(_))
    }
}
