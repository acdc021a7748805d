//! Pipeline error taxonomy.
//!
//! Every failure a generator can surface is one of these variants; handlers
//! map them onto HTTP statuses in `main.rs`. Two cases are deliberately
//! non-fatal and never reach this enum: an unsupported MIME type (extraction
//! returns an empty result) and upload-time extraction failure (logged,
//! recovered lazily later).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model output failed strict and fallback parsing: {0}")]
    MalformedOutput(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Generation(format!("{err:#}"))
    }
}

impl From<crate::store::StoreError> for PipelineError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::DocumentNotFound(id) => PipelineError::NotFound(id),
            other => PipelineError::Generation(other.to_string()),
        }
    }
}

impl From<crate::llm::LlmError> for PipelineError {
    fn from(err: crate::llm::LlmError) -> Self {
        PipelineError::Generation(err.to_string())
    }
}
