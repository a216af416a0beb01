use crate::error::EmbeddingError;
use rayon::prelude::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;
pub const DEFAULT_EMBEDDING_MODEL: &str = "paraphrase-multilingual-minilm-l12-v2";

/// Maps text to a fixed-length vector. `embed_batch` must agree element for
/// element with calling `embed` on each input.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

pub fn check_dimensions(expected: usize, vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

/// Hashed character-trigram embedder. Needs no model files, which makes it
/// the offline fallback and the embedder used throughout the tests.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
    model_id: String,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("char-trigram-{dimensions}"),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.par_iter().map(|text| self.embed_text(text)).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeBackend {
    /// Accelerated when compiled in, general-purpose otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda => f.write_str("cuda"),
        }
    }
}

impl FromStr for ComputeBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(format!("unknown compute backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderKind {
    #[default]
    FastEmbed,
    CharacterNgram,
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FastEmbed => f.write_str("fastembed"),
            Self::CharacterNgram => f.write_str("ngram"),
        }
    }
}

impl FromStr for EmbedderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fastembed" | "local" => Ok(Self::FastEmbed),
            "ngram" | "trigram" => Ok(Self::CharacterNgram),
            other => Err(format!("unknown embedder: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub kind: EmbedderKind,
    pub model: String,
    pub backend: ComputeBackend,
    pub cache_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub ngram_dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: EmbedderKind::FastEmbed,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            backend: ComputeBackend::Auto,
            cache_dir: None,
            batch_size: 64,
            ngram_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

/// Loads the configured embedder. Failure here is a startup error.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let embedder: Arc<dyn Embedder> = match config.kind {
        EmbedderKind::CharacterNgram => Arc::new(CharacterNgramEmbedder::new(config.ngram_dimensions)),
        EmbedderKind::FastEmbed => load_fastembed(config)?,
    };

    info!(
        model = embedder.model_id(),
        dimensions = embedder.dimensions(),
        backend = %config.backend,
        "embedding model ready"
    );
    Ok(embedder)
}

#[cfg(feature = "local-embeddings")]
fn load_fastembed(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    Ok(Arc::new(local::FastEmbedder::new(config)?))
}

#[cfg(not(feature = "local-embeddings"))]
fn load_fastembed(_config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    Err(EmbeddingError::Unavailable(
        "built without the `local-embeddings` feature".to_string(),
    ))
}

const SUPPORTED_MODELS: [&str; 7] = [
    "paraphrase-multilingual-minilm-l12-v2",
    "paraphrase-multilingual-mpnet-base-v2",
    "multilingual-e5-small",
    "multilingual-e5-base",
    "multilingual-e5-large",
    "all-minilm-l6-v2",
    "bge-small-en-v1.5",
];

/// Short lowercase model name shared by every spelling of the same model,
/// e.g. `sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2`.
/// Used as the model id recorded in the index.
pub fn canonical_model_name(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_ascii_lowercase();
    let short = lowered.rsplit('/').next().unwrap_or(&lowered);
    SUPPORTED_MODELS.iter().copied().find(|model| *model == short)
}

#[cfg(feature = "local-embeddings")]
pub use local::FastEmbedder;

#[cfg(feature = "local-embeddings")]
mod local {
    use super::{canonical_model_name, check_dimensions, ComputeBackend, Embedder, EmbeddingConfig};
    use crate::error::EmbeddingError;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::{Mutex, MutexGuard};

    /// ONNX sentence-embedding model run in-process through fastembed.
    pub struct FastEmbedder {
        model: Mutex<TextEmbedding>,
        model_id: String,
        dimensions: usize,
        batch_size: usize,
    }

    impl FastEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
            let canonical = canonical_model_name(&config.model).ok_or_else(|| {
                EmbeddingError::Unavailable(format!("unsupported embedding model: {}", config.model))
            })?;
            let model = resolve_model(canonical)?;
            let mut options = InitOptions::new(model).with_show_download_progress(true);
            if let Some(dir) = &config.cache_dir {
                options = options.with_cache_dir(dir.clone());
            }
            let options = with_backend(options, config.backend)?;

            let mut text_model = TextEmbedding::try_new(options).map_err(|error| {
                EmbeddingError::Unavailable(format!("failed to load {}: {error}", config.model))
            })?;

            let probe = text_model
                .embed(vec!["dimension probe"], None)
                .map_err(|error| EmbeddingError::Unavailable(error.to_string()))?;
            let dimensions = probe
                .first()
                .map(Vec::len)
                .filter(|dimensions| *dimensions > 0)
                .ok_or_else(|| {
                    EmbeddingError::Unavailable(format!("{} produced no vector", config.model))
                })?;

            Ok(Self {
                model: Mutex::new(text_model),
                model_id: canonical.to_string(),
                dimensions,
                batch_size: config.batch_size.max(1),
            })
        }

        fn lock(&self) -> Result<MutexGuard<'_, TextEmbedding>, EmbeddingError> {
            self.model
                .lock()
                .map_err(|_| EmbeddingError::Failed("embedding model lock poisoned".to_string()))
        }
    }

    impl Embedder for FastEmbedder {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let mut model = self.lock()?;
            let vector = model
                .embed(vec![text], None)
                .map_err(|error| EmbeddingError::Failed(error.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingError::Failed("model returned no vector".to_string()))?;
            check_dimensions(self.dimensions, vector)
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }

            let mut model = self.lock()?;
            let vectors = model
                .embed(texts.to_vec(), Some(self.batch_size))
                .map_err(|error| EmbeddingError::Failed(error.to_string()))?;
            if vectors.len() != texts.len() {
                return Err(EmbeddingError::Failed(format!(
                    "model returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }

            vectors
                .into_iter()
                .map(|vector| check_dimensions(self.dimensions, vector))
                .collect()
        }
    }

    fn resolve_model(canonical: &str) -> Result<EmbeddingModel, EmbeddingError> {
        match canonical {
            "paraphrase-multilingual-minilm-l12-v2" => Ok(EmbeddingModel::ParaphraseMLMiniLML12V2),
            "paraphrase-multilingual-mpnet-base-v2" => Ok(EmbeddingModel::ParaphraseMLMpnetBaseV2),
            "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(EmbeddingModel::MultilingualE5Large),
            "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
            other => Err(EmbeddingError::Unavailable(format!(
                "unsupported embedding model: {other}"
            ))),
        }
    }

    #[cfg(feature = "cuda")]
    fn with_backend(
        options: InitOptions,
        backend: ComputeBackend,
    ) -> Result<InitOptions, EmbeddingError> {
        use ort::execution_providers::{CUDAExecutionProvider, ExecutionProviderDispatch};

        let cuda = ExecutionProviderDispatch::from(CUDAExecutionProvider::default());
        match backend {
            ComputeBackend::Cpu => Ok(options),
            ComputeBackend::Auto => Ok(options.with_execution_providers(vec![cuda])),
            ComputeBackend::Cuda => {
                Ok(options.with_execution_providers(vec![cuda.error_on_failure()]))
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn with_backend(
        options: InitOptions,
        backend: ComputeBackend,
    ) -> Result<InitOptions, EmbeddingError> {
        match backend {
            ComputeBackend::Cuda => Err(EmbeddingError::Unavailable(
                "cuda backend requested but built without the `cuda` feature".to_string(),
            )),
            ComputeBackend::Auto | ComputeBackend::Cpu => Ok(options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow").expect("embeds");
        let second = embedder.embed("Hydraulic pressure and flow").expect("embeds");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder::new(32);
        let vector = embedder.embed("abc").expect("embeds");
        assert_eq!(vector.len(), 32);
        assert_eq!(embedder.model_id(), "char-trigram-32");
    }

    #[test]
    fn batch_matches_single_embeddings() {
        let embedder = CharacterNgramEmbedder::default();
        let texts = vec![
            "Tuition fees at Qatar University".to_string(),
            "Logement étudiant".to_string(),
            String::new(),
        ];
        let batch = embedder.embed_batch(&texts).expect("embeds");
        let single = texts
            .iter()
            .map(|text| embedder.embed(text).expect("embeds"))
            .collect::<Vec<_>>();
        assert_eq!(batch, single);
    }

    #[test]
    fn model_spellings_share_one_id() {
        assert_eq!(
            canonical_model_name("sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2"),
            Some(DEFAULT_EMBEDDING_MODEL)
        );
        assert_eq!(
            canonical_model_name(DEFAULT_EMBEDDING_MODEL),
            Some(DEFAULT_EMBEDDING_MODEL)
        );
        assert_eq!(canonical_model_name("intfloat/Multilingual-E5-Small"), Some("multilingual-e5-small"));
        assert_eq!(canonical_model_name("word2vec"), None);
    }

    #[test]
    fn dimension_check_fails_fast() {
        assert!(check_dimensions(3, vec![0.0, 1.0, 0.0]).is_ok());
        assert!(matches!(
            check_dimensions(4, vec![0.0, 1.0, 0.0]),
            Err(EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn ngram_embedder_is_created_from_config() {
        let config = EmbeddingConfig {
            kind: EmbedderKind::CharacterNgram,
            ngram_dimensions: 64,
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).expect("ngram embedder always loads");
        assert_eq!(embedder.dimensions(), 64);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_backend_requires_the_cuda_feature() {
        let config = EmbeddingConfig {
            backend: ComputeBackend::Cuda,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            create_embedder(&config),
            Err(EmbeddingError::Unavailable(_))
        ));
    }

    #[test]
    fn backend_and_kind_parse_from_flags() {
        assert_eq!("GPU".parse::<ComputeBackend>(), Ok(ComputeBackend::Cuda));
        assert_eq!("cpu".parse::<ComputeBackend>(), Ok(ComputeBackend::Cpu));
        assert_eq!("ngram".parse::<EmbedderKind>(), Ok(EmbedderKind::CharacterNgram));
        assert!("tpu".parse::<ComputeBackend>().is_err());
    }
}
