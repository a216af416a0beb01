//! Layout-noise removal for text extracted from PDF pages.
//!
//! Each step is a no-op on text that is already clean, so normalizing twice
//! yields the same output as normalizing once.

use crate::error::IngestError;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

const PAGINATION_PATTERN: &str = r"(?i)^(?:page\s*\d+(?:\s*(?:of|/)\s*\d+)?|\d{1,4}|[-–]\s*\d{1,4}\s*[-–]|\d{1,4}\s*\|\s*p\s*a\s*g\s*e)$";
const HYPHEN_BREAK_PATTERN: &str = r"(\w)-[ \t]*\n[ \t]*(\w)";
const BLANK_RUN_PATTERN: &str = r"\n{3,}";

/// Lines longer than this are treated as content even when they repeat.
const RUNNING_HEADER_MAX_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct TextNormalizer {
    pagination: Regex,
    hyphen_break: Regex,
    blank_run: Regex,
    headers: Vec<String>,
    case_insensitive_headers: bool,
}

impl TextNormalizer {
    pub fn new(
        boilerplate_headers: &[String],
        case_insensitive_headers: bool,
    ) -> Result<Self, IngestError> {
        let mut normalizer = Self {
            pagination: Regex::new(PAGINATION_PATTERN)?,
            hyphen_break: Regex::new(HYPHEN_BREAK_PATTERN)?,
            blank_run: Regex::new(BLANK_RUN_PATTERN)?,
            headers: Vec::new(),
            case_insensitive_headers,
        };
        normalizer.add_headers(boilerplate_headers);
        Ok(normalizer)
    }

    /// A copy of this normalizer that also strips `extra` header lines.
    pub fn with_headers(&self, extra: &[String]) -> Self {
        let mut normalizer = self.clone();
        normalizer.add_headers(extra);
        normalizer
    }

    fn add_headers(&mut self, headers: &[String]) {
        for header in headers {
            let key = self.header_key(header);
            if !key.is_empty() && !self.headers.contains(&key) {
                self.headers.push(key);
            }
        }
    }

    fn header_key(&self, line: &str) -> String {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if self.case_insensitive_headers {
            collapsed.to_lowercase()
        } else {
            collapsed
        }
    }

    pub fn is_pagination_line(&self, line: &str) -> bool {
        self.pagination.is_match(line.trim())
    }

    fn is_header_line(&self, line: &str) -> bool {
        if self.headers.is_empty() {
            return false;
        }
        let key = self.header_key(line);
        !key.is_empty() && self.headers.contains(&key)
    }

    pub fn normalize(&self, raw: &str) -> String {
        let spaced = normalize_whitespace(raw);

        let kept = spaced
            .split('\n')
            .filter(|line| !self.is_pagination_line(line))
            .filter(|line| !self.is_header_line(line))
            .collect::<Vec<_>>()
            .join("\n");

        let joined = self.hyphen_break.replace_all(&kept, "${1}${2}");
        let collapsed = self.blank_run.replace_all(&joined, "\n\n");

        collapsed.trim().to_string()
    }
}

/// Collapses runs of spaces, tabs, and non-breaking spaces inside each line,
/// drops trailing whitespace, and unifies line endings. Newlines survive so
/// paragraph boundaries stay visible to the splitter.
pub fn normalize_whitespace(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(|line| {
            line.split(|c: char| c == ' ' || c == '\t' || c == '\u{a0}' || c == '\u{c}')
                .filter(|piece| !piece.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Running headers and footers: a page's first or last non-blank line that
/// recurs in that position on at least `min_fraction` of a document's pages
/// (and on at least `min_pages` pages). Lines inside a page body are never
/// candidates, even when they repeat.
pub fn detect_repeated_lines(pages: &[String], min_pages: usize, min_fraction: f32) -> Vec<String> {
    if pages.len() < min_pages.max(2) {
        return Vec::new();
    }

    let threshold = ((pages.len() as f32) * min_fraction).ceil() as usize;
    let threshold = threshold.max(min_pages).max(2);

    let mut counts = BTreeMap::<String, usize>::new();
    for page in pages {
        let lines = page
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        // A one-line page is all body.
        if lines.len() < 2 {
            continue;
        }

        let edges = [lines.first(), lines.last()]
            .into_iter()
            .flatten()
            .filter(|line| {
                let length = line.chars().count();
                length >= 4 && length <= RUNNING_HEADER_MAX_CHARS
            })
            .filter(|line| line.chars().any(char::is_alphabetic))
            .cloned()
            .collect::<HashSet<_>>();

        for line in edges {
            *counts.entry(line).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(line, _)| line)
        .collect()
}
