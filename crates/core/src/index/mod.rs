//! Exact nearest-neighbour index over chunk embeddings.
//!
//! The index is built once from a full batch of entries and never mutated
//! afterwards; `search` takes `&self`, so a loaded index can be shared across
//! request handlers behind an `Arc`.

mod persist;

pub use persist::{IndexManifest, INDEX_FORMAT, INDEX_SCHEMA_VERSION};

use crate::error::IndexError;
use crate::models::{DistanceMetric, IndexEntry, RetrievalHit, SearchResult};

#[derive(Debug, Clone)]
pub struct VectorIndex {
    model_id: String,
    metric: DistanceMetric,
    dimensions: usize,
    entries: Vec<IndexEntry>,
    norms: Vec<f32>,
}

impl VectorIndex {
    pub fn build(
        entries: Vec<IndexEntry>,
        model_id: impl Into<String>,
        metric: DistanceMetric,
    ) -> Result<Self, IndexError> {
        let dimensions = entries
            .first()
            .map(|entry| entry.vector.len())
            .ok_or(IndexError::EmptyCorpus)?;

        if dimensions == 0 {
            return Err(IndexError::InvalidArgument(
                "embedding vectors must not be empty".to_string(),
            ));
        }

        for entry in &entries {
            if entry.vector.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    actual: entry.vector.len(),
                });
            }
            if entry.vector.iter().any(|value| !value.is_finite()) {
                return Err(IndexError::InvalidArgument(format!(
                    "chunk {} has a non-finite embedding value",
                    entry.chunk.chunk_id
                )));
            }
        }

        Ok(Self::from_parts(model_id.into(), metric, dimensions, entries))
    }

    fn from_parts(
        model_id: String,
        metric: DistanceMetric,
        dimensions: usize,
        entries: Vec<IndexEntry>,
    ) -> Self {
        let norms = entries.iter().map(|entry| norm(&entry.vector)).collect();
        Self {
            model_id,
            metric,
            dimensions,
            entries,
            norms,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// The `k` best entries for `query`, best first. Equal scores keep
    /// insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchResult, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidArgument("k must be at least 1".to_string()));
        }
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if query.iter().any(|value| !value.is_finite()) {
            return Err(IndexError::InvalidArgument(
                "query vector has a non-finite value".to_string(),
            ));
        }

        let query_norm = norm(query);
        let mut scored = self
            .entries
            .iter()
            .zip(&self.norms)
            .enumerate()
            .map(|(position, (entry, entry_norm))| {
                let score = match self.metric {
                    DistanceMetric::Cosine => {
                        cosine_similarity(query, query_norm, &entry.vector, *entry_norm)
                    }
                    DistanceMetric::L2 => 1.0 / (1.0 + l2_distance(query, &entry.vector)),
                };
                (position, score)
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(k);

        let hits = scored
            .into_iter()
            .enumerate()
            .map(|(rank, (position, score))| RetrievalHit {
                chunk: self.entries[position].chunk.clone(),
                score,
                rank: rank + 1,
            })
            .collect();

        Ok(SearchResult::from_hits(hits))
    }
}

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|value| value * value).sum::<f32>().sqrt()
}

fn cosine_similarity(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    let denominator = a_norm * b_norm;
    if denominator < f32::EPSILON {
        return 0.0;
    }
    let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    dot / denominator
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::sample_chunk;

    pub(crate) fn entry(source: &str, text: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry::new(sample_chunk(source, text), vector)
    }

    pub(crate) fn sample_index(metric: DistanceMetric) -> VectorIndex {
        VectorIndex::build(
            vec![
                entry("a.pdf", "north", vec![0.0, 1.0, 0.0]),
                entry("b.pdf", "east", vec![1.0, 0.0, 0.0]),
                entry("a.pdf", "north-east", vec![0.7, 0.7, 0.0]),
                entry("c.pdf", "up", vec![0.0, 0.0, 1.0]),
            ],
            "test-model",
            metric,
        )
        .expect("valid entries")
    }

    #[test]
    fn empty_corpus_is_rejected() {
        let result = VectorIndex::build(Vec::new(), "m", DistanceMetric::Cosine);
        assert!(matches!(result, Err(IndexError::EmptyCorpus)));
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let result = VectorIndex::build(
            vec![
                entry("a.pdf", "one", vec![1.0, 0.0]),
                entry("a.pdf", "two", vec![1.0, 0.0, 0.0]),
            ],
            "m",
            DistanceMetric::Cosine,
        );
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn cosine_results_are_best_first() {
        let index = sample_index(DistanceMetric::Cosine);
        let result = index.search(&[0.1, 1.0, 0.0], 3).expect("search succeeds");

        let texts = result
            .hits
            .iter()
            .map(|hit| hit.chunk.content())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["north", "north-east", "east"]);
        assert!(result.hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
        assert_eq!(
            result.hits.iter().map(|hit| hit.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(result.source_ids, vec!["a.pdf".to_string(), "b.pdf".to_string()]);
    }

    #[test]
    fn l2_results_are_best_first() {
        let index = sample_index(DistanceMetric::L2);
        let result = index.search(&[0.9, 0.1, 0.0], 2).expect("search succeeds");
        assert_eq!(result.hits[0].chunk.content(), "east");
        assert_eq!(result.hits[1].chunk.content(), "north-east");
        assert!(result.hits[0].score > result.hits[1].score);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let index = sample_index(DistanceMetric::Cosine);
        let result = index.search(&[1.0, 1.0, 1.0], 50).expect("search succeeds");
        assert_eq!(result.hits.len(), index.len());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let index = VectorIndex::build(
            vec![
                entry("a.pdf", "first", vec![1.0, 0.0]),
                entry("b.pdf", "second", vec![1.0, 0.0]),
                entry("c.pdf", "third", vec![1.0, 0.0]),
            ],
            "m",
            DistanceMetric::Cosine,
        )
        .expect("valid entries");

        let result = index.search(&[1.0, 0.0], 3).expect("search succeeds");
        let texts = result
            .hits
            .iter()
            .map(|hit| hit.chunk.content())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn invalid_queries_are_rejected() {
        let index = sample_index(DistanceMetric::Cosine);
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 0),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0], 1),
            Err(IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            index.search(&[f32::NAN, 0.0, 0.0], 1),
            Err(IndexError::InvalidArgument(_))
        ));
    }
}
