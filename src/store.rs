//! Persistence seam for documents and generated artifacts.
//!
//! The pipeline only ever talks to [`StudyStore`]; the shipped backend is
//! the in-memory [`MemoryStore`]. Collection artifacts are replaced per
//! document on regeneration so repeated "generate" clicks never accumulate
//! stale duplicates. Weak points are keyed by (document, concept) and are
//! only ever mutated, never replaced wholesale.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::schema::{
    ComplexTopic, Document, ExamPrediction, Flashcard, GlossaryTerm, Note, QuizQuestion, Summary,
    WeakPoint,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait StudyStore: Send + Sync {
    // Documents
    async fn create_document(&self, doc: Document) -> Result<(), StoreError>;
    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;
    /// Write the canonical extracted text for a document.
    async fn update_document_content(&self, id: &str, text: &str) -> Result<(), StoreError>;

    // Summary (singleton per document)
    async fn get_summary(&self, document_id: &str) -> Result<Option<Summary>, StoreError>;
    async fn upsert_summary(&self, summary: Summary) -> Result<Summary, StoreError>;

    // Collection artifacts (replaced per document on regeneration)
    async fn replace_flashcards(
        &self,
        document_id: &str,
        cards: Vec<Flashcard>,
    ) -> Result<(), StoreError>;
    async fn flashcards_for(&self, document_id: &str) -> Result<Option<Vec<Flashcard>>, StoreError>;

    async fn replace_questions(
        &self,
        document_id: &str,
        questions: Vec<QuizQuestion>,
    ) -> Result<(), StoreError>;
    async fn questions_for(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<QuizQuestion>>, StoreError>;

    async fn replace_notes(&self, document_id: &str, notes: Vec<Note>) -> Result<(), StoreError>;
    async fn notes_for(&self, document_id: &str) -> Result<Option<Vec<Note>>, StoreError>;

    async fn replace_terms(
        &self,
        document_id: &str,
        terms: Vec<GlossaryTerm>,
    ) -> Result<(), StoreError>;
    async fn terms_for(&self, document_id: &str) -> Result<Option<Vec<GlossaryTerm>>, StoreError>;

    async fn replace_predictions(
        &self,
        document_id: &str,
        predictions: Vec<ExamPrediction>,
    ) -> Result<(), StoreError>;
    async fn predictions_for(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<ExamPrediction>>, StoreError>;

    async fn replace_topics(
        &self,
        document_id: &str,
        topics: Vec<ComplexTopic>,
    ) -> Result<(), StoreError>;
    async fn topics_for(&self, document_id: &str) -> Result<Option<Vec<ComplexTopic>>, StoreError>;

    // Weak points
    async fn find_weak_point(
        &self,
        document_id: &str,
        concept: &str,
    ) -> Result<Option<WeakPoint>, StoreError>;
    async fn upsert_weak_point(&self, point: WeakPoint) -> Result<WeakPoint, StoreError>;
    async fn weak_points_for(&self, document_id: &str) -> Result<Vec<WeakPoint>, StoreError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Document>,
    summaries: HashMap<String, Summary>,
    flashcards: HashMap<String, Vec<Flashcard>>,
    questions: HashMap<String, Vec<QuizQuestion>>,
    notes: HashMap<String, Vec<Note>>,
    terms: HashMap<String, Vec<GlossaryTerm>>,
    predictions: HashMap<String, Vec<ExamPrediction>>,
    topics: HashMap<String, Vec<ComplexTopic>>,
    /// Keyed by `(document_id, concept)`.
    weak_points: HashMap<(String, String), WeakPoint>,
}

/// In-memory store, all tables behind one `RwLock`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StudyStore for MemoryStore {
    async fn create_document(&self, doc: Document) -> Result<(), StoreError> {
        self.write().documents.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.read().documents.get(id).cloned())
    }

    async fn update_document_content(&self, id: &str, text: &str) -> Result<(), StoreError> {
        let mut tables = self.write();
        let doc = tables
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        doc.extracted_text = text.to_string();
        Ok(())
    }

    async fn get_summary(&self, document_id: &str) -> Result<Option<Summary>, StoreError> {
        Ok(self.read().summaries.get(document_id).cloned())
    }

    async fn upsert_summary(&self, mut summary: Summary) -> Result<Summary, StoreError> {
        let mut tables = self.write();
        // One summary per document: keep the original id on overwrite.
        if let Some(existing) = tables.summaries.get(&summary.document_id) {
            summary.id = existing.id.clone();
        }
        tables
            .summaries
            .insert(summary.document_id.clone(), summary.clone());
        Ok(summary)
    }

    async fn replace_flashcards(
        &self,
        document_id: &str,
        cards: Vec<Flashcard>,
    ) -> Result<(), StoreError> {
        self.write()
            .flashcards
            .insert(document_id.to_string(), cards);
        Ok(())
    }

    async fn flashcards_for(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<Flashcard>>, StoreError> {
        Ok(self.read().flashcards.get(document_id).cloned())
    }

    async fn replace_questions(
        &self,
        document_id: &str,
        questions: Vec<QuizQuestion>,
    ) -> Result<(), StoreError> {
        self.write()
            .questions
            .insert(document_id.to_string(), questions);
        Ok(())
    }

    async fn questions_for(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<QuizQuestion>>, StoreError> {
        Ok(self.read().questions.get(document_id).cloned())
    }

    async fn replace_notes(&self, document_id: &str, notes: Vec<Note>) -> Result<(), StoreError> {
        self.write().notes.insert(document_id.to_string(), notes);
        Ok(())
    }

    async fn notes_for(&self, document_id: &str) -> Result<Option<Vec<Note>>, StoreError> {
        Ok(self.read().notes.get(document_id).cloned())
    }

    async fn replace_terms(
        &self,
        document_id: &str,
        terms: Vec<GlossaryTerm>,
    ) -> Result<(), StoreError> {
        self.write().terms.insert(document_id.to_string(), terms);
        Ok(())
    }

    async fn terms_for(&self, document_id: &str) -> Result<Option<Vec<GlossaryTerm>>, StoreError> {
        Ok(self.read().terms.get(document_id).cloned())
    }

    async fn replace_predictions(
        &self,
        document_id: &str,
        predictions: Vec<ExamPrediction>,
    ) -> Result<(), StoreError> {
        self.write()
            .predictions
            .insert(document_id.to_string(), predictions);
        Ok(())
    }

    async fn predictions_for(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<ExamPrediction>>, StoreError> {
        Ok(self.read().predictions.get(document_id).cloned())
    }

    async fn replace_topics(
        &self,
        document_id: &str,
        topics: Vec<ComplexTopic>,
    ) -> Result<(), StoreError> {
        self.write().topics.insert(document_id.to_string(), topics);
        Ok(())
    }

    async fn topics_for(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<ComplexTopic>>, StoreError> {
        Ok(self.read().topics.get(document_id).cloned())
    }

    async fn find_weak_point(
        &self,
        document_id: &str,
        concept: &str,
    ) -> Result<Option<WeakPoint>, StoreError> {
        let key = (document_id.to_string(), concept.to_string());
        Ok(self.read().weak_points.get(&key).cloned())
    }

    async fn upsert_weak_point(&self, point: WeakPoint) -> Result<WeakPoint, StoreError> {
        let key = (point.document_id.clone(), point.concept.clone());
        self.write().weak_points.insert(key, point.clone());
        Ok(point)
    }

    async fn weak_points_for(&self, document_id: &str) -> Result<Vec<WeakPoint>, StoreError> {
        let mut points: Vec<WeakPoint> = self
            .read()
            .weak_points
            .values()
            .filter(|p| p.document_id == document_id)
            .cloned()
            .collect();
        // Needs Work first, most recent mistakes first within each group.
        points.sort_by(|a, b| {
            a.status
                .sort_rank()
                .cmp(&b.status.sort_rank())
                .then(b.last_mistake.cmp(&a.last_mistake))
        });
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::WeakPointStatus;

    #[tokio::test]
    async fn document_roundtrip() {
        let store = MemoryStore::new();
        let doc = Document::new("notes.pdf".to_string());
        let id = doc.id.clone();
        store.create_document(doc).await.unwrap();

        store
            .update_document_content(&id, "extracted text body")
            .await
            .unwrap();
        let loaded = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(loaded.extracted_text, "extracted text body");
    }

    #[tokio::test]
    async fn update_content_for_missing_document_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_document_content("doc_missing", "text")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn summary_upsert_keeps_id() {
        let store = MemoryStore::new();
        let first = store
            .upsert_summary(Summary::new("doc_1", "first pass".to_string()))
            .await
            .unwrap();
        let second = store
            .upsert_summary(Summary::new("doc_1", "second pass".to_string()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let current = store.get_summary("doc_1").await.unwrap().unwrap();
        assert_eq!(current.content, "second pass");
    }

    #[tokio::test]
    async fn weak_points_sort_needs_work_first() {
        let store = MemoryStore::new();

        let mut mastered = WeakPoint::new("doc_1", "Osmosis");
        mastered.status = WeakPointStatus::Mastered;
        store.upsert_weak_point(mastered).await.unwrap();
        store
            .upsert_weak_point(WeakPoint::new("doc_1", "Photosynthesis"))
            .await
            .unwrap();

        let points = store.weak_points_for("doc_1").await.unwrap();
        assert_eq!(points[0].concept, "Photosynthesis");
        assert_eq!(points[0].status, WeakPointStatus::NeedsWork);
        assert_eq!(points[1].status, WeakPointStatus::Mastered);
    }
}
