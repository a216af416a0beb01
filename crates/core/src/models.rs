use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw text of one source page, as handed to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub source_id: String,
    pub page_number: Option<u32>,
    pub raw_text: String,
}

/// Byte range of a chunk's content inside the normalized page text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub page_number: Option<u32>,
    /// Label prefix followed by the content.
    pub text: String,
    /// Byte offset in `text` where the content begins.
    pub content_offset: usize,
    /// Characters of content, label excluded.
    pub char_count: usize,
    pub span: Span,
}

impl Chunk {
    pub fn content(&self) -> &str {
        self.text.get(self.content_offset..).unwrap_or_default()
    }

    pub fn label(&self) -> Option<&str> {
        self.text
            .get(..self.content_offset)
            .map(str::trim_end)
            .filter(|label| !label.is_empty())
    }
}

/// A chunk paired with its embedding, as stored by the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub source_id: String,
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl IndexEntry {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self {
            source_id: chunk.source_id.clone(),
            chunk,
            vector,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::L2 => f.write_str("l2"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "l2" | "euclidean" => Ok(Self::L2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub chunk: Chunk,
    /// Higher is better for every metric.
    pub score: f32,
    /// 1-based position in the result list.
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResult {
    pub hits: Vec<RetrievalHit>,
    pub source_ids: Vec<String>,
}

impl SearchResult {
    pub fn from_hits(hits: Vec<RetrievalHit>) -> Self {
        let source_ids = unique_sources(&hits);
        Self { hits, source_ids }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Source ids of `hits` in rank order, first occurrence wins.
pub fn unique_sources(hits: &[RetrievalHit]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for hit in hits {
        if !sources.contains(&hit.chunk.source_id) {
            sources.push(hit.chunk.source_id.clone());
        }
    }
    sources
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedContext {
    pub reformulated_question: String,
    pub context_text: String,
    pub source_ids: Vec<String>,
    pub hits: Vec<RetrievalHit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    Context(RetrievedContext),
    /// Nothing in the index cleared the relevance bar for this question.
    NoRelevantInformation { reformulated_question: String },
}

impl RetrievalOutcome {
    pub fn reformulated_question(&self) -> &str {
        match self {
            Self::Context(context) => &context.reformulated_question,
            Self::NoRelevantInformation {
                reformulated_question,
            } => reformulated_question,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub min_chunk_chars: usize,
    pub boilerplate_headers: Vec<String>,
    pub case_insensitive_headers: bool,
    /// Also strip a page's first or last line when it recurs across most of
    /// the document's pages. Off by default; only configured headers are
    /// removed otherwise.
    pub detect_running_headers: bool,
    pub label_chunks: bool,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 1_200,
            chunk_overlap_chars: 300,
            min_chunk_chars: 50,
            boilerplate_headers: Vec::new(),
            case_insensitive_headers: true,
            detect_running_headers: false,
            label_chunks: true,
        }
    }
}

/// `min_score` 0.0 only rejects hits with no similarity at all. Dense
/// sentence embeddings score almost any pair of texts above zero, so raise it
/// when the no-relevant-information outcome should trigger with such models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_score: 0.0,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_chunk(source_id: &str, content: &str) -> Chunk {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(content.as_bytes());

    Chunk {
        chunk_id: format!("{:x}", hasher.finalize()),
        source_id: source_id.to_string(),
        page_number: Some(1),
        text: content.to_string(),
        content_offset: 0,
        char_count: content.chars().count(),
        span: Span {
            start: 0,
            end: content.len(),
        },
    }
}
