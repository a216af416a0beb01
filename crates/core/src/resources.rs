use crate::embeddings::{create_embedder, Embedder, EmbeddingConfig};
use crate::error::{EmbeddingError, RetrievalError};
use crate::index::VectorIndex;
use crate::models::RetrievalOptions;
use crate::orchestrator::RetrievalEngine;
use crate::reformulate::QueryReformulator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Embedding model and index loaded at most once per process, on first use.
/// Concurrent first callers wait for the same initialisation.
pub struct Resources {
    embedding: EmbeddingConfig,
    index_dir: PathBuf,
    embedder: OnceCell<Arc<dyn Embedder>>,
    index: OnceCell<Arc<VectorIndex>>,
}

impl Resources {
    pub fn new(embedding: EmbeddingConfig, index_dir: impl Into<PathBuf>) -> Self {
        Self {
            embedding,
            index_dir: index_dir.into(),
            embedder: OnceCell::new(),
            index: OnceCell::new(),
        }
    }

    pub async fn embedder(&self) -> Result<Arc<dyn Embedder>, EmbeddingError> {
        self.embedder
            .get_or_try_init(|| async {
                let config = self.embedding.clone();
                tokio::task::spawn_blocking(move || create_embedder(&config))
                    .await
                    .map_err(|error| {
                        EmbeddingError::Unavailable(format!("model loading task failed: {error}"))
                    })?
            })
            .await
            .cloned()
    }

    /// Loads the index and checks it against the serving embedder.
    pub async fn index(&self) -> Result<Arc<VectorIndex>, RetrievalError> {
        let embedder = self.embedder().await?;
        let index = self
            .index
            .get_or_try_init(|| async {
                let index = VectorIndex::load_for(&self.index_dir, embedder.as_ref())?;
                info!(path = %self.index_dir.display(), entries = index.len(), "index ready");
                Ok::<_, RetrievalError>(Arc::new(index))
            })
            .await?;
        Ok(Arc::clone(index))
    }

    pub async fn engine(
        &self,
        reformulator: QueryReformulator,
        options: RetrievalOptions,
    ) -> Result<RetrievalEngine, RetrievalError> {
        let embedder = self.embedder().await?;
        let index = self.index().await?;
        RetrievalEngine::new(reformulator, embedder, index, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, EmbedderKind};
    use std::path::Path;
    use crate::error::IndexError;
    use crate::models::{sample_chunk, DistanceMetric, IndexEntry};
    use tempfile::tempdir;

    fn ngram_config(dimensions: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            kind: EmbedderKind::CharacterNgram,
            ngram_dimensions: dimensions,
            ..EmbeddingConfig::default()
        }
    }

    fn save_ngram_index(dir: &Path, dimensions: usize) {
        let embedder = CharacterNgramEmbedder::new(dimensions);
        let entries = ["Tuition is charged per credit hour.", "Housing opens in August."]
            .iter()
            .map(|text| {
                let vector = embedder.embed(text).expect("ngram embedding");
                IndexEntry::new(sample_chunk("guide.pdf", text), vector)
            })
            .collect();
        VectorIndex::build(entries, embedder.model_id(), DistanceMetric::Cosine)
            .expect("index builds")
            .save(dir)
            .expect("index saves");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_instance() {
        let dir = tempdir().expect("tempdir");
        save_ngram_index(dir.path(), 32);
        let resources = Resources::new(ngram_config(32), dir.path());

        let (left, right) = tokio::join!(resources.index(), resources.index());
        let (left, right) = (left.expect("index loads"), right.expect("index loads"));
        assert!(Arc::ptr_eq(&left, &right));

        let first = resources.embedder().await.expect("embedder");
        let second = resources.embedder().await.expect("embedder");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_index_is_reported() {
        let dir = tempdir().expect("tempdir");
        let resources = Resources::new(ngram_config(32), dir.path().join("absent"));

        let result = resources.index().await;
        assert!(matches!(
            result,
            Err(RetrievalError::Index(IndexError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn index_built_with_another_embedder_is_refused() {
        let dir = tempdir().expect("tempdir");
        save_ngram_index(dir.path(), 32);
        let resources = Resources::new(ngram_config(64), dir.path());

        let result = resources.index().await;
        assert!(matches!(
            result,
            Err(RetrievalError::Index(IndexError::DimensionMismatch { .. }))
        ));
    }
}
