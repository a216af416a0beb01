use crate::embeddings::{check_dimensions, Embedder};
use crate::error::{EmbeddingError, IndexError, RetrievalError};
use crate::index::VectorIndex;
use crate::models::{
    unique_sources, ConversationTurn, RetrievalHit, RetrievalOptions, RetrievalOutcome,
    RetrievedContext, SearchResult,
};
use crate::reformulate::QueryReformulator;
use std::sync::Arc;
use tracing::{debug, info};

/// Reformulates, embeds, searches and assembles context. Answer generation
/// is left to the caller.
pub struct RetrievalEngine {
    reformulator: QueryReformulator,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    options: RetrievalOptions,
}

impl RetrievalEngine {
    pub fn new(
        reformulator: QueryReformulator,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        options: RetrievalOptions,
    ) -> Result<Self, RetrievalError> {
        if options.top_k == 0 {
            return Err(IndexError::InvalidArgument("top_k must be positive".to_string()).into());
        }
        if embedder.dimensions() != index.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: index.dimensions(),
                actual: embedder.dimensions(),
            }
            .into());
        }

        Ok(Self {
            reformulator,
            embedder,
            index,
            options,
        })
    }

    pub async fn retrieve(
        &self,
        history: &[ConversationTurn],
        question: &str,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        if question.trim().is_empty() {
            return Err(RetrievalError::EmptyQuestion);
        }

        let reformulated = self.reformulator.reformulate(history, question).await?;
        let result = self.search_text(&reformulated, self.options.top_k).await?;
        let outcome = assemble(reformulated, result.hits, self.options.min_score);

        match &outcome {
            RetrievalOutcome::Context(context) => info!(
                question = %context.reformulated_question,
                hits = context.hits.len(),
                sources = ?context.source_ids,
                "context retrieved"
            ),
            RetrievalOutcome::NoRelevantInformation {
                reformulated_question,
            } => info!(question = %reformulated_question, "no relevant information"),
        }
        Ok(outcome)
    }

    /// Raw nearest-neighbour search for `text`, no reformulation and no
    /// score threshold.
    pub async fn search_text(&self, text: &str, k: usize) -> Result<SearchResult, RetrievalError> {
        search_index(&self.embedder, &self.index, text, k).await
    }
}

/// Embeds `text` on the blocking pool and returns the `k` nearest chunks.
pub async fn search_index(
    embedder: &Arc<dyn Embedder>,
    index: &VectorIndex,
    text: &str,
    k: usize,
) -> Result<SearchResult, RetrievalError> {
    if text.trim().is_empty() {
        return Err(RetrievalError::EmptyQuestion);
    }

    let vector = embed_query(Arc::clone(embedder), text.to_string()).await?;
    let vector = check_dimensions(index.dimensions(), vector)?;
    let result = index.search(&vector, k)?;
    debug!(k, hits = result.hits.len(), "index searched");
    Ok(result)
}

async fn embed_query(embedder: Arc<dyn Embedder>, text: String) -> Result<Vec<f32>, EmbeddingError> {
    tokio::task::spawn_blocking(move || embedder.embed(&text))
        .await
        .map_err(|error| EmbeddingError::Failed(format!("embedding task failed: {error}")))?
}

/// Keeps hits scoring strictly above `min_score`. Hits arrive best first, so
/// filtering only trims the tail and ranks stay contiguous.
pub fn assemble(
    reformulated_question: String,
    hits: Vec<RetrievalHit>,
    min_score: f32,
) -> RetrievalOutcome {
    let hits = hits
        .into_iter()
        .filter(|hit| hit.score > min_score)
        .collect::<Vec<_>>();

    if hits.is_empty() {
        return RetrievalOutcome::NoRelevantInformation {
            reformulated_question,
        };
    }

    let context_text = hits
        .iter()
        .map(|hit| hit.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    RetrievalOutcome::Context(RetrievedContext {
        reformulated_question,
        context_text,
        source_ids: unique_sources(&hits),
        hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::ModelError;
    use crate::ingest::{build_index, chunk_documents};
    use crate::models::{sample_chunk, DistanceMetric, Document, IngestionOptions};
    use crate::normalize::TextNormalizer;
    use crate::traits::fakes::ScriptedModel;

    const ADMISSIONS: &str = "Admissions at Qatar University require the zyxquor certificate \
for every international applicant.";
    const HOUSING: &str = "Housing at Wheeling University includes the plimbatz residence \
hall for first year students.";

    fn corpus_index(embedder: &CharacterNgramEmbedder) -> Arc<VectorIndex> {
        let normalizer = TextNormalizer::new(&[], true).expect("valid patterns");
        let mut chunks = Vec::new();
        for (source, text) in [("admissions.pdf", ADMISSIONS), ("housing.pdf", HOUSING)] {
            let pages = vec![Document {
                source_id: source.to_string(),
                page_number: Some(1),
                raw_text: text.to_string(),
            }];
            chunks.extend(
                chunk_documents(source, pages, &normalizer, &IngestionOptions::default())
                    .expect("chunking succeeds"),
            );
        }
        Arc::new(build_index(chunks, embedder, DistanceMetric::Cosine, 8).expect("index builds"))
    }

    fn test_engine(model: Arc<ScriptedModel>, options: RetrievalOptions) -> RetrievalEngine {
        let embedder = CharacterNgramEmbedder::new(256);
        let index = corpus_index(&embedder);
        RetrievalEngine::new(QueryReformulator::new(model), Arc::new(embedder), index, options)
            .expect("engine configured")
    }

    #[tokio::test]
    async fn unique_token_finds_its_document() {
        let model = Arc::new(ScriptedModel::default());
        let engine = test_engine(model.clone(), RetrievalOptions::default());

        let outcome = engine.retrieve(&[], "plimbatz").await.expect("retrieval works");

        let RetrievalOutcome::Context(context) = outcome else {
            panic!("expected context");
        };
        assert_eq!(context.reformulated_question, "plimbatz");
        assert_eq!(context.hits[0].chunk.source_id, "housing.pdf");
        assert_eq!(context.hits[0].rank, 1);
        assert_eq!(context.source_ids[0], "housing.pdf");
        assert!(context.context_text.starts_with("Document Source: housing\n\n"));
        assert_eq!(model.request_count(), 0);
    }

    #[tokio::test]
    async fn unrelated_question_yields_the_sentinel() {
        // Too short for a single trigram, so every score is exactly zero.
        let lenient = test_engine(Arc::new(ScriptedModel::default()), RetrievalOptions::default());
        let outcome = lenient.retrieve(&[], "ok").await.expect("retrieval works");
        assert_eq!(
            outcome,
            RetrievalOutcome::NoRelevantInformation {
                reformulated_question: "ok".to_string()
            }
        );

        let strict = RetrievalOptions {
            min_score: 0.5,
            ..RetrievalOptions::default()
        };
        let strict = test_engine(Arc::new(ScriptedModel::default()), strict);
        let outcome = strict.retrieve(&[], "qqqq").await.expect("retrieval works");
        assert!(matches!(
            outcome,
            RetrievalOutcome::NoRelevantInformation { .. }
        ));
    }

    #[tokio::test]
    async fn follow_up_is_searched_in_reformulated_form() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(
            "Which certificate does zyxquor admission need?".to_string(),
        )]));
        let engine = test_engine(model.clone(), RetrievalOptions::default());
        let history = vec![
            ConversationTurn::user("Tell me about admissions at Qatar University"),
            ConversationTurn::assistant("Admissions need a certificate."),
        ];

        let outcome = engine
            .retrieve(&history, "which one?")
            .await
            .expect("retrieval works");

        assert_eq!(
            outcome.reformulated_question(),
            "Which certificate does zyxquor admission need?"
        );
        let RetrievalOutcome::Context(context) = outcome else {
            panic!("expected context");
        };
        assert_eq!(context.hits[0].chunk.source_id, "admissions.pdf");
        assert_eq!(model.request_count(), 1);
    }

    #[tokio::test]
    async fn downstream_failure_is_not_swallowed() {
        let model = Arc::new(ScriptedModel::replying(vec![Err(ModelError::Unauthorized(
            "bad key".to_string(),
        ))]));
        let engine = test_engine(model, RetrievalOptions::default());
        let history = vec![ConversationTurn::user("hello")];

        let error = engine
            .retrieve(&history, "and housing?")
            .await
            .expect_err("model failure propagates");
        assert!(error.is_downstream());
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let engine = test_engine(Arc::new(ScriptedModel::default()), RetrievalOptions::default());
        assert!(matches!(
            engine.retrieve(&[], "   ").await,
            Err(RetrievalError::EmptyQuestion)
        ));
    }

    #[test]
    fn mismatched_embedder_is_rejected_up_front() {
        let index = corpus_index(&CharacterNgramEmbedder::new(256));
        let result = RetrievalEngine::new(
            QueryReformulator::new(Arc::new(ScriptedModel::default())),
            Arc::new(CharacterNgramEmbedder::new(32)),
            index,
            RetrievalOptions::default(),
        );
        assert!(matches!(
            result,
            Err(RetrievalError::Index(IndexError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn assemble_applies_threshold_and_dedupes_sources() {
        let hit = |source: &str, text: &str, score: f32, rank: usize| RetrievalHit {
            chunk: sample_chunk(source, text),
            score,
            rank,
        };
        let hits = vec![
            hit("a.pdf", "first", 0.9, 1),
            hit("b.pdf", "second", 0.5, 2),
            hit("a.pdf", "third", 0.4, 3),
            hit("c.pdf", "fourth", 0.1, 4),
        ];

        let RetrievalOutcome::Context(context) = assemble("q".to_string(), hits, 0.2) else {
            panic!("expected context");
        };
        assert_eq!(context.hits.len(), 3);
        assert_eq!(context.context_text, "first\n\nsecond\n\nthird");
        assert_eq!(context.source_ids, vec!["a.pdf", "b.pdf"]);

        let below = vec![hit("a.pdf", "first", 0.0, 1)];
        assert!(matches!(
            assemble("q".to_string(), below, 0.0),
            RetrievalOutcome::NoRelevantInformation { .. }
        ));
    }
}
