pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod reformulate;
pub mod resources;
pub mod traits;

pub use chunking::{build_chunks, document_label, split_spans, ChunkingConfig};
pub use embeddings::{
    canonical_model_name, create_embedder, CharacterNgramEmbedder, ComputeBackend, Embedder, EmbedderKind,
    EmbeddingConfig, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL,
};
pub use error::{
    BuildError, EmbeddingError, IndexError, IngestError, ModelError, RetrievalError,
};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use generation::{ChatAnswerGenerator, ADVISOR_INSTRUCTIONS, NO_RELEVANT_INFORMATION_REPLY};
pub use index::{IndexManifest, VectorIndex};
pub use ingest::{
    build_index, chunk_documents, discover_pdf_files, ingest_folder_chunks_best_effort,
    ingest_folder_with, IngestionReport, SkippedPdf,
};
pub use llm::{ChatMessage, ChatModelConfig, ChatRole, CompletionOptions, OpenAiCompatibleChat};
pub use models::{
    Chunk, ConversationTurn, DistanceMetric, Document, IndexEntry, IngestionOptions,
    RetrievalHit, RetrievalOptions, RetrievalOutcome, RetrievedContext, Role, SearchResult, Span,
};
pub use normalize::{detect_repeated_lines, normalize_whitespace, TextNormalizer};
pub use orchestrator::{search_index, RetrievalEngine};
pub use reformulate::QueryReformulator;
pub use resources::Resources;
pub use traits::{AnswerGenerator, ChatModel};
