//! Artifact types produced by the generation pipeline.
//!
//! Each artifact kind is persisted as individual records (one row per
//! flashcard, per question, per note) so callers can query them
//! independently of the generation run that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

// ============================================================================
// Document
// ============================================================================

/// A stored document record. `extracted_text`, once longer than the
/// authoritative threshold, is never silently overwritten by a later
/// recovery attempt; only a re-upload replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    /// Path to the stored source file, if the upload was persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    /// Declared or inferred MIME type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub extracted_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    /// Minimum extracted-text length treated as usable content.
    pub const MIN_CONTENT_LEN: usize = 10;

    pub fn new(file_name: String) -> Self {
        Self {
            id: new_id("doc"),
            file_name,
            source_location: None,
            mime_type: None,
            extracted_text: String::new(),
            language: None,
            content_hash: None,
            uploaded_at: Utc::now(),
        }
    }

    pub fn has_content(&self) -> bool {
        self.extracted_text.len() > Self::MIN_CONTENT_LEN
    }

    pub fn language_or_default(&self) -> &str {
        self.language.as_deref().unwrap_or("English")
    }
}

// ============================================================================
// Generated artifacts
// ============================================================================

/// Singleton per document; regenerating overwrites in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// `ceil(content_len / 1000)` minutes. A rough proxy, not word-based.
    pub reading_time_minutes: u32,
    pub updated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(document_id: &str, content: String) -> Self {
        let reading_time_minutes = Self::reading_time(content.len());
        Self {
            id: new_id("sum"),
            document_id: document_id.to_string(),
            content,
            reading_time_minutes,
            updated_at: Utc::now(),
        }
    }

    pub fn reading_time(content_len: usize) -> u32 {
        content_len.div_ceil(1000) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flashcard {
    #[serde(default = "flashcard_id")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    pub front: String,
    pub back: String,
}

fn flashcard_id() -> String {
    new_id("card")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizQuestion {
    #[serde(default = "question_id")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    pub question: String,
    pub options: Vec<String>,
    /// Index into `options`.
    pub correct_index: usize,
    #[serde(default)]
    pub explanation: Option<String>,
}

fn question_id() -> String {
    new_id("q")
}

/// One note per bullet point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    #[serde(default = "note_id")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    pub content: String,
}

fn note_id() -> String {
    new_id("note")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryTerm {
    #[serde(default = "term_id")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    pub term: String,
    pub definition: String,
}

fn term_id() -> String {
    new_id("term")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamPrediction {
    #[serde(default = "prediction_id")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    pub question: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub likelihood: Option<String>,
}

fn prediction_id() -> String {
    new_id("pred")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexTopic {
    #[serde(default = "topic_id")]
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    pub topic: String,
    pub explanation: String,
}

fn topic_id() -> String {
    new_id("topic")
}

// ============================================================================
// Weak points
// ============================================================================

/// Mastery status with an explicit sort ordinal: anything still needing
/// work lists before mastered concepts, independent of string ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeakPointStatus {
    #[serde(rename = "Needs Work")]
    NeedsWork,
    Mastered,
}

impl WeakPointStatus {
    pub fn sort_rank(self) -> u8 {
        match self {
            WeakPointStatus::NeedsWork => 0,
            WeakPointStatus::Mastered => 1,
        }
    }
}

/// Per-(document, concept) record of repeated mistakes. A repeated mistake
/// on a mastered concept resets it to `NeedsWork`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakPoint {
    pub id: String,
    pub document_id: String,
    pub concept: String,
    pub mistake_count: u32,
    pub status: WeakPointStatus,
    pub last_mistake: DateTime<Utc>,
    /// Cached targeted lesson, computed once and reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_lesson: Option<String>,
}

impl WeakPoint {
    pub fn new(document_id: &str, concept: &str) -> Self {
        Self {
            id: new_id("weak"),
            document_id: document_id.to_string(),
            concept: concept.to_string(),
            mistake_count: 1,
            status: WeakPointStatus::NeedsWork,
            last_mistake: Utc::now(),
            repair_lesson: None,
        }
    }
}

// ============================================================================
// Chat
// ============================================================================

/// One prior conversational turn, supplied by the caller on each request.
/// History is ephemeral; the core never persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}
