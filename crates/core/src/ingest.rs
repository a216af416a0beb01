use crate::chunking::{build_chunks, document_label, ChunkingConfig};
use crate::embeddings::{check_dimensions, Embedder};
use crate::error::{BuildError, IndexError, IngestError};
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::index::VectorIndex;
use crate::models::{Chunk, DistanceMetric, Document, IndexEntry, IngestionOptions};
use crate::normalize::{detect_repeated_lines, normalize_whitespace, TextNormalizer};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const RUNNING_HEADER_MIN_PAGES: usize = 3;
const RUNNING_HEADER_MIN_FRACTION: f32 = 0.5;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub chunks: Vec<Chunk>,
    pub skipped_files: Vec<SkippedPdf>,
    pub documents: usize,
    pub pages: usize,
}

pub fn ingest_folder_chunks_best_effort(
    folder: &Path,
    options: &IngestionOptions,
) -> Result<IngestionReport, IngestError> {
    ingest_folder_with(folder, &LopdfExtractor, options)
}

/// Extracts, cleans and splits every PDF under `folder`. Files that fail are
/// recorded in the report and never abort the batch. Chunk order follows
/// the sorted file list regardless of how the work was scheduled.
pub fn ingest_folder_with(
    folder: &Path,
    extractor: &dyn PdfExtractor,
    options: &IngestionOptions,
) -> Result<IngestionReport, IngestError> {
    let files = discover_pdf_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        )));
    }

    let normalizer = TextNormalizer::new(
        &options.boilerplate_headers,
        options.case_insensitive_headers,
    )?;
    // Surface a bad chunk configuration once instead of once per file.
    ChunkingConfig::from(options).window(0)?;

    info!(folder = %folder.display(), files = files.len(), "ingesting pdf folder");

    let outcomes = files
        .par_iter()
        .map(|path| {
            let source_id = source_id_for(folder, path)?;
            let pages = extractor
                .extract_pages(path)?
                .into_iter()
                .map(|page| page.into_document(&source_id))
                .collect::<Vec<_>>();
            let page_count = pages.len();
            let chunks = chunk_documents(&source_id, pages, &normalizer, options)?;
            Ok::<_, IngestError>((page_count, chunks))
        })
        .collect::<Vec<_>>();

    let mut report = IngestionReport::default();
    for (path, outcome) in files.into_iter().zip(outcomes) {
        match outcome {
            Ok((pages, chunks)) => {
                debug!(path = %path.display(), pages, chunks = chunks.len(), "pdf ingested");
                report.documents += 1;
                report.pages += pages;
                report.chunks.extend(chunks);
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable pdf");
                report.skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        documents = report.documents,
        pages = report.pages,
        chunks = report.chunks.len(),
        skipped = report.skipped_files.len(),
        "ingestion finished"
    );
    Ok(report)
}

/// Cleans and splits the pages of one document. When enabled, first or last
/// page lines repeated across most pages are stripped as running headers.
pub fn chunk_documents(
    source_id: &str,
    pages: Vec<Document>,
    normalizer: &TextNormalizer,
    options: &IngestionOptions,
) -> Result<Vec<Chunk>, IngestError> {
    let config = ChunkingConfig::from(options);

    let document_normalizer = if options.detect_running_headers {
        let spaced = pages
            .iter()
            .map(|page| normalize_whitespace(&page.raw_text))
            .collect::<Vec<_>>();
        let repeated = detect_repeated_lines(
            &spaced,
            RUNNING_HEADER_MIN_PAGES,
            RUNNING_HEADER_MIN_FRACTION,
        );
        if !repeated.is_empty() {
            debug!(source = source_id, lines = repeated.len(), "running headers detected");
        }
        normalizer.with_headers(&repeated)
    } else {
        normalizer.clone()
    };

    let label = options.label_chunks.then(|| document_label(source_id));

    let mut chunks = Vec::new();
    for page in pages {
        let normalized = document_normalizer.normalize(&page.raw_text);
        if normalized.is_empty() {
            continue;
        }
        chunks.extend(build_chunks(
            source_id,
            page.page_number,
            label.as_deref(),
            &normalized,
            config,
        )?);
    }
    Ok(chunks)
}

/// Embeds chunks in batches and builds the index. An empty corpus is an
/// error rather than an empty index.
pub fn build_index(
    chunks: Vec<Chunk>,
    embedder: &dyn Embedder,
    metric: DistanceMetric,
    batch_size: usize,
) -> Result<VectorIndex, BuildError> {
    if chunks.is_empty() {
        return Err(IndexError::EmptyCorpus.into());
    }
    if batch_size == 0 {
        return Err(IngestError::InvalidArgument("batch size must be positive".to_string()).into());
    }

    let total = chunks.len();
    let mut entries = Vec::with_capacity(total);

    for batch in chunks.chunks(batch_size) {
        let texts = batch.iter().map(|chunk| chunk.text.clone()).collect::<Vec<_>>();
        let vectors = embedder.embed_batch(&texts)?;
        if vectors.len() != batch.len() {
            return Err(IngestError::InvalidArgument(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            ))
            .into());
        }

        for (chunk, vector) in batch.iter().zip(vectors) {
            let vector = check_dimensions(embedder.dimensions(), vector)?;
            entries.push(IndexEntry::new(chunk.clone(), vector));
        }
        debug!(embedded = entries.len(), total, "embedding progress");
    }

    let index = VectorIndex::build(entries, embedder.model_id(), metric)?;
    info!(
        entries = index.len(),
        dimensions = index.dimensions(),
        model = index.model_id(),
        %metric,
        "vector index built"
    );
    Ok(index)
}

/// File name for top-level PDFs, folder-relative path for nested ones so
/// that equal names in different folders stay distinct.
fn source_id_for(folder: &Path, path: &Path) -> Result<String, IngestError> {
    let relative = path.strip_prefix(folder).unwrap_or(path);
    if relative.file_name().is_none() {
        return Err(IngestError::MissingFileName(path.display().to_string()));
    }

    Ok(relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
