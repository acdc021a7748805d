//! Text extraction from uploaded source files.
//!
//! Dispatches on MIME type: PDFs are parsed with lopdf into a single text
//! blob (page boundaries are dropped on purpose to keep the context
//! contiguous for prompting), plain text is read verbatim. An unsupported
//! MIME type is a no-op, not an error; a missing or unreadable source
//! propagates as `PipelineError::Extraction`.

use anyhow::{Context, Result};
use serde_json::json;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::PipelineError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

/// Fallback when neither the stored type tag nor the extension is known.
pub const MIME_UNKNOWN: &str = "application/octet-stream";

/// Overlapping chunk geometry kept for future indexing. Chunks themselves
/// are not persisted; only the count is reported.
const CHUNK_SIZE: usize = 1000;
const CHUNK_OVERLAP: usize = 200;

/// One extracted text segment with provenance metadata.
#[derive(Debug, Clone)]
pub struct Segment {
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Extraction output: the segments plus a chunk-count diagnostic.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub segments: Vec<Segment>,
    pub chunk_count: usize,
}

impl ExtractionResult {
    /// All segment text joined into the canonical context blob.
    pub fn combined_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Infer a MIME type from a declared tag or the file name extension.
pub fn infer_mime(declared: Option<&str>, file_name: &str) -> &'static str {
    match declared {
        Some(MIME_PDF) => return MIME_PDF,
        Some(MIME_TEXT) => return MIME_TEXT,
        _ => {}
    }
    let lower = file_name.to_lowercase();
    if lower.ends_with(".pdf") {
        MIME_PDF
    } else if lower.ends_with(".txt") {
        MIME_TEXT
    } else {
        MIME_UNKNOWN
    }
}

/// Extract text from a source file by MIME type.
pub async fn extract(source: &Path, mime: &str) -> Result<ExtractionResult, PipelineError> {
    let data = tokio::fs::read(source)
        .await
        .map_err(|e| PipelineError::Extraction(format!("cannot read {}: {e}", source.display())))?;

    let segments = match mime {
        MIME_PDF => extract_pdf(&data)
            .map_err(|e| PipelineError::Extraction(format!("{e:#}")))?,
        MIME_TEXT => {
            let text = String::from_utf8_lossy(&data).to_string();
            vec![Segment {
                metadata: json!({ "bytes": data.len() }),
                text,
            }]
        }
        other => {
            warn!("Unsupported MIME type {other}, skipping extraction");
            Vec::new()
        }
    };

    let chunk_count = segments
        .iter()
        .map(|s| chunk_text(&s.text, CHUNK_SIZE, CHUNK_OVERLAP).len())
        .sum();

    info!(
        "Extracted {} segment(s), {} chunk(s) from {}",
        segments.len(),
        chunk_count,
        source.display()
    );

    Ok(ExtractionResult {
        segments,
        chunk_count,
    })
}

/// Extract all pages of a PDF as one text segment.
fn extract_pdf(data: &[u8]) -> Result<Vec<Segment>> {
    use lopdf::Document;

    let doc = Document::load_from(Cursor::new(data)).context("failed to load PDF")?;

    let mut text = String::new();
    let pages = doc.get_pages();
    let total_pages = pages.len();

    for (page_num, _) in pages {
        if let Ok(content) = doc.extract_text(&[page_num]) {
            text.push_str(&content);
            text.push('\n');
        }
    }

    debug!("PDF extraction: {} pages, {} chars", total_pages, text.len());

    Ok(vec![Segment {
        text,
        metadata: json!({ "pages": total_pages }),
    }])
}

/// Split text into overlapping character chunks.
fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mime_inference() {
        assert_eq!(infer_mime(Some(MIME_PDF), "whatever"), MIME_PDF);
        assert_eq!(infer_mime(None, "Lecture.PDF"), MIME_PDF);
        assert_eq!(infer_mime(None, "notes.txt"), MIME_TEXT);
        assert_eq!(infer_mime(None, "archive.zip"), MIME_UNKNOWN);
    }

    #[test]
    fn chunking_overlaps() {
        let text = "a".repeat(2500);
        let chunks = chunk_text(&text, 1000, 200);
        // Steps of 800: 0..1000, 800..1800, 1600..2500.
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[2].len(), 900);
    }

    #[test]
    fn chunking_short_text_is_one_chunk() {
        assert_eq!(chunk_text("short", 1000, 200).len(), 1);
        assert!(chunk_text("", 1000, 200).is_empty());
    }

    #[tokio::test]
    async fn plain_text_read_verbatim() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Hello world, this is a test.").unwrap();

        let result = extract(file.path(), MIME_TEXT).await.unwrap();
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.combined_text(), "Hello world, this is a test.");
        assert_eq!(result.chunk_count, 1);
    }

    #[tokio::test]
    async fn unsupported_mime_is_empty_not_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = extract(file.path(), MIME_UNKNOWN).await.unwrap();
        assert!(result.segments.is_empty());
        assert_eq!(result.chunk_count, 0);
    }

    #[tokio::test]
    async fn missing_file_is_extraction_error() {
        let err = extract(Path::new("/nonexistent/source.txt"), MIME_TEXT)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }
}
