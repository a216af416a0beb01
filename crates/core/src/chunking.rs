//! Boundary-aware splitting of normalized page text into overlapping chunks.
//!
//! Every chunk's content is an exact slice of the input. Breaks prefer a
//! paragraph boundary, then a sentence end, then a line break, then a space,
//! and fall back to a hard character cut only when the window holds none of
//! those. Dropping the overlapping prefix of each chunk and concatenating
//! what remains gives back the input text.

use crate::error::IngestError;
use crate::models::{Chunk, IngestionOptions, Span};
use sha2::{Digest, Sha256};
use std::path::Path;

const LABEL_TITLE_MAX_CHARS: usize = 80;
const SENTENCE_ENDS: [&str; 6] = [". ", "! ", "? ", ".\n", "!\n", "?\n"];

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
            min_chars: value.min_chunk_chars,
        }
    }
}

impl ChunkingConfig {
    /// Content budget left once a label of `label_chars` is prefixed.
    pub fn window(&self, label_chars: usize) -> Result<usize, IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max chunk size must be positive".to_string(),
            ));
        }

        let window = self
            .max_chars
            .checked_sub(label_chars)
            .filter(|window| *window > 0)
            .ok_or_else(|| {
                IngestError::InvalidChunkConfig(format!(
                    "label of {label_chars} chars leaves no room in chunks of {} chars",
                    self.max_chars
                ))
            })?;

        if self.overlap_chars >= window {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than the splitting window {window}",
                self.overlap_chars
            )));
        }

        Ok(window)
    }
}

/// Splits `text` into spans of at most `window` characters where consecutive
/// spans share at most `overlap` characters.
pub fn split_spans(text: &str, window: usize, overlap: usize) -> Vec<Span> {
    let bounds = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect::<Vec<_>>();
    let total = bounds.len() - 1;

    if total == 0 || window == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(window - 1);

    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        if total - start <= window {
            spans.push(Span {
                start: bounds[start],
                end: bounds[total],
            });
            break;
        }

        let end = find_break(text, &bounds, start, start + window, start + overlap + 1);
        spans.push(Span {
            start: bounds[start],
            end: bounds[end],
        });
        start = overlap_start(text, &bounds, end, overlap);
    }

    spans
}

/// Char index just past the best separator in `[start, limit)` that still
/// ends at or after `min_end`; `limit` when no separator qualifies.
fn find_break(text: &str, bounds: &[usize], start: usize, limit: usize, min_end: usize) -> usize {
    let window = &text[bounds[start]..bounds[limit]];
    let to_char_index = |byte_end: usize| {
        bounds
            .binary_search(&(bounds[start] + byte_end))
            .ok()
            .filter(|index| *index >= min_end)
    };

    let paragraph = window.rfind("\n\n").map(|at| at + 2);
    let sentence = SENTENCE_ENDS
        .iter()
        .filter_map(|end| window.rfind(end).map(|at| at + end.len()))
        .max();
    let line = window.rfind('\n').map(|at| at + 1);
    let word = window.rfind(' ').map(|at| at + 1);

    [paragraph, sentence, line, word]
        .into_iter()
        .flatten()
        .find_map(to_char_index)
        .unwrap_or(limit)
}

/// Start of the next span: `overlap` chars before `end`, moved forward to
/// the next word start inside the overlap when there is one.
fn overlap_start(text: &str, bounds: &[usize], end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }

    let candidate = end - overlap;
    let char_at = |index: usize| text[bounds[index]..].chars().next();
    let at_word_start = char_at(candidate - 1).is_some_and(char::is_whitespace);
    if at_word_start {
        return candidate;
    }

    match (candidate..end).find(|index| char_at(*index).is_some_and(char::is_whitespace)) {
        Some(mut index) => {
            while index < end && char_at(index).is_some_and(char::is_whitespace) {
                index += 1;
            }
            index
        }
        None => candidate,
    }
}

/// `Document Source: <title>` where the title comes from the file stem.
pub fn document_label(source_id: &str) -> String {
    let stem = Path::new(source_id)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(source_id);

    let title = stem
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let title = title.chars().take(LABEL_TITLE_MAX_CHARS).collect::<String>();

    format!("Document Source: {title}")
}

pub fn build_chunks(
    source_id: &str,
    page_number: Option<u32>,
    label: Option<&str>,
    normalized: &str,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    let prefix = label
        .map(|label| format!("{label}\n\n"))
        .unwrap_or_default();
    let window = config.window(prefix.chars().count())?;

    let chunks = split_spans(normalized, window, config.overlap_chars)
        .into_iter()
        .filter_map(|span| {
            let content = &normalized[span.start..span.end];
            let signal = content.chars().filter(|c| !c.is_whitespace()).count();
            if signal < config.min_chars {
                return None;
            }

            Some(Chunk {
                chunk_id: make_chunk_id(source_id, page_number, span.start),
                source_id: source_id.to_string(),
                page_number,
                text: format!("{prefix}{content}"),
                content_offset: prefix.len(),
                char_count: content.chars().count(),
                span,
            })
        })
        .collect();

    Ok(chunks)
}

fn make_chunk_id(source_id: &str, page_number: Option<u32>, offset: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(page_number.unwrap_or(0).to_le_bytes());
    hasher.update((offset as u64).to_le_bytes());
    format!("{:x}", hasher.finalize())
}
