//! Context preparation: cleaning, bounding and lazy content recovery.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::extractor;
use crate::schema::Document;
use crate::store::StudyStore;

/// Resolved document context handed to every generator.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub text: String,
    pub language: String,
}

fn horizontal_ws() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").expect("static regex"))
}

fn newline_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\n\s*").expect("static regex"))
}

/// Normalize raw extracted text: strip non-printable control characters
/// (standard whitespace survives), collapse horizontal whitespace runs to a
/// single space and newline runs to a single newline, trim the ends.
/// Pure and idempotent.
pub fn clean(text: &str) -> String {
    let printable: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let collapsed = horizontal_ws().replace_all(&printable, " ");
    let collapsed = newline_runs().replace_all(&collapsed, "\n");
    collapsed.trim().to_string()
}

/// Hard truncation to the first `max_chars` characters. Not sentence-aware;
/// trailing content past the budget is dropped silently.
pub fn bound(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Guarantee a document has usable text context, re-deriving it from the
/// stored source when missing. Upload-time extraction is fire-and-forget,
/// so this recovery path is the correctness backstop for every generator.
pub async fn ensure_content(
    store: &dyn StudyStore,
    document_id: &str,
) -> Result<ResolvedContext, PipelineError> {
    let doc = load_document(store, document_id).await?;

    // Fast path: authoritative text already present, never re-extract.
    if doc.has_content() {
        return Ok(resolved(&doc));
    }

    if doc.source_location.is_none() {
        return Err(PipelineError::ContentUnavailable(format!(
            "content not found for document {document_id}"
        )));
    }

    info!("Lazy recovery for document {document_id}");
    ingest(store, document_id).await?;

    let doc = load_document(store, document_id).await?;
    if doc.has_content() {
        Ok(resolved(&doc))
    } else {
        warn!("Lazy recovery produced no usable text for document {document_id}");
        Err(PipelineError::ContentUnavailable(format!(
            "recovery failed for document {document_id}"
        )))
    }
}

/// Extract a document's source file and persist the combined text as the
/// canonical context. Returns the chunk-count diagnostic. Used both by the
/// explicit ingest trigger (including background extraction after upload)
/// and by lazy recovery.
pub async fn ingest(store: &dyn StudyStore, document_id: &str) -> Result<usize, PipelineError> {
    let doc = load_document(store, document_id).await?;
    let Some(source) = doc.source_location.clone() else {
        return Err(PipelineError::ContentUnavailable(format!(
            "document {document_id} has no source location"
        )));
    };

    let mime = extractor::infer_mime(doc.mime_type.as_deref(), &doc.file_name);
    let result = extractor::extract(Path::new(&source), mime).await?;

    let text = result.combined_text();
    if !text.is_empty() {
        store.update_document_content(document_id, &text).await?;
    }
    Ok(result.chunk_count)
}

async fn load_document(
    store: &dyn StudyStore,
    document_id: &str,
) -> Result<Document, PipelineError> {
    store
        .get_document(document_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(document_id.to_string()))
}

fn resolved(doc: &Document) -> ResolvedContext {
    ResolvedContext {
        text: doc.extracted_text.clone(),
        language: doc.language_or_default().to_string(),
    }
}
