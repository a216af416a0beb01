//! On-disk layout: `manifest.json` describes the index (format marker,
//! schema version, model, metric, dimension, entry count, payload checksum,
//! chunk metadata) and `vectors.bin` holds the little-endian `f32` payload.
//! Every shape invariant is checked before the payload is decoded.

use super::VectorIndex;
use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::models::{Chunk, DistanceMetric, IndexEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

pub const INDEX_FORMAT: &str = "pdf-rag-vector-index";
pub const INDEX_SCHEMA_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.bin";
const F32_BYTES: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexManifest {
    pub format: String,
    pub schema_version: u32,
    pub model_id: String,
    pub metric: DistanceMetric,
    pub dimensions: usize,
    pub entry_count: usize,
    pub created_at: DateTime<Utc>,
    pub vectors_sha256: String,
    pub chunks: Vec<Chunk>,
}

impl VectorIndex {
    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir)?;

        let payload = self
            .entries
            .iter()
            .flat_map(|entry| entry.vector.iter())
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<u8>>();

        let manifest = IndexManifest {
            format: INDEX_FORMAT.to_string(),
            schema_version: INDEX_SCHEMA_VERSION,
            model_id: self.model_id.clone(),
            metric: self.metric,
            dimensions: self.dimensions,
            entry_count: self.entries.len(),
            created_at: Utc::now(),
            vectors_sha256: digest(&payload),
            chunks: self.entries.iter().map(|entry| entry.chunk.clone()).collect(),
        };

        write_replacing(&dir.join(VECTORS_FILE), &payload)?;
        write_replacing(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;

        info!(
            path = %dir.display(),
            entries = manifest.entry_count,
            dimensions = manifest.dimensions,
            model = %manifest.model_id,
            "vector index saved"
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, IndexError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = match fs::read(&manifest_path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::NotFound(dir.to_path_buf()));
            }
            Err(error) => return Err(error.into()),
        };

        let manifest: IndexManifest = serde_json::from_slice(&raw).map_err(|error| {
            IndexError::corrupt(&manifest_path, format!("unreadable manifest: {error}"))
        })?;
        validate_manifest(&manifest, &manifest_path)?;

        let vectors_path = dir.join(VECTORS_FILE);
        let expected_len = manifest
            .entry_count
            .checked_mul(manifest.dimensions)
            .and_then(|values| values.checked_mul(F32_BYTES))
            .ok_or_else(|| IndexError::corrupt(&manifest_path, "declared shape overflows"))?;

        let actual_len = match fs::metadata(&vectors_path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::corrupt(&vectors_path, "vector payload is missing"));
            }
            Err(error) => return Err(error.into()),
        };
        if actual_len != expected_len as u64 {
            return Err(IndexError::corrupt(
                &vectors_path,
                format!("expected {expected_len} bytes of vectors, found {actual_len}"),
            ));
        }

        let payload = fs::read(&vectors_path)?;
        if payload.len() != expected_len {
            return Err(IndexError::corrupt(&vectors_path, "vector payload changed while loading"));
        }
        if digest(&payload) != manifest.vectors_sha256 {
            return Err(IndexError::corrupt(&vectors_path, "vector payload checksum mismatch"));
        }

        let values = payload
            .chunks_exact(F32_BYTES)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect::<Vec<_>>();
        if values.iter().any(|value| !value.is_finite()) {
            return Err(IndexError::corrupt(&vectors_path, "non-finite vector value"));
        }

        let dimensions = manifest.dimensions;
        let entries = manifest
            .chunks
            .into_iter()
            .zip(values.chunks_exact(dimensions))
            .map(|(chunk, vector)| IndexEntry::new(chunk, vector.to_vec()))
            .collect::<Vec<_>>();

        info!(
            path = %dir.display(),
            entries = entries.len(),
            dimensions,
            model = %manifest.model_id,
            "vector index loaded"
        );
        Ok(Self::from_parts(
            manifest.model_id,
            manifest.metric,
            dimensions,
            entries,
        ))
    }

    /// Loads the index and checks it was built with the embedder that will
    /// embed queries against it.
    pub fn load_for(dir: &Path, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        let index = Self::load(dir)?;

        if index.dimensions != embedder.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: index.dimensions,
                actual: embedder.dimensions(),
            });
        }
        if index.model_id != embedder.model_id() {
            return Err(IndexError::ModelMismatch {
                index: index.model_id.clone(),
                embedder: embedder.model_id().to_string(),
            });
        }

        Ok(index)
    }
}

fn validate_manifest(manifest: &IndexManifest, path: &Path) -> Result<(), IndexError> {
    if manifest.format != INDEX_FORMAT {
        return Err(IndexError::corrupt(
            path,
            format!("unknown format marker {:?}", manifest.format),
        ));
    }
    if manifest.schema_version != INDEX_SCHEMA_VERSION {
        return Err(IndexError::corrupt(
            path,
            format!("unsupported schema version {}", manifest.schema_version),
        ));
    }
    if manifest.dimensions == 0 {
        return Err(IndexError::corrupt(path, "embedding dimension is zero"));
    }
    if manifest.entry_count == 0 {
        return Err(IndexError::corrupt(path, "index declares no entries"));
    }
    if manifest.chunks.len() != manifest.entry_count {
        return Err(IndexError::corrupt(
            path,
            format!(
                "manifest declares {} entries but lists {} chunks",
                manifest.entry_count,
                manifest.chunks.len()
            ),
        ));
    }

    for chunk in &manifest.chunks {
        let offset_ok = chunk.content_offset <= chunk.text.len()
            && chunk.text.is_char_boundary(chunk.content_offset);
        if chunk.chunk_id.is_empty() || !offset_ok || chunk.span.start > chunk.span.end {
            return Err(IndexError::corrupt(
                path,
                format!("malformed chunk record {:?}", chunk.chunk_id),
            ));
        }
    }

    Ok(())
}

fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)?;
    Ok(())
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
