//! The artifact generation pipeline.
//!
//! Every generator follows the same sequence: resolve content, clean and
//! bound it to the mode's budget, build the prompt, make one model call,
//! parse, persist. Nothing is retried here; a failed generation surfaces to
//! the caller, who may simply invoke it again. No partial artifact is ever
//! persisted: persistence happens only after a successful parse.

use chrono::Utc;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ContextBudgets;
use crate::context::{self, ResolvedContext};
use crate::error::PipelineError;
use crate::llm::{LlmClient, Message, TokenStream};
use crate::prompts;
use crate::schema::{
    ChatTurn, ComplexTopic, ExamPrediction, Flashcard, GlossaryTerm, Note, QuizQuestion, Summary,
    WeakPoint, WeakPointStatus,
};
use crate::store::StudyStore;

pub struct Pipeline {
    store: Arc<dyn StudyStore>,
    llm: Arc<dyn LlmClient>,
    budgets: ContextBudgets,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn StudyStore>,
        llm: Arc<dyn LlmClient>,
        budgets: ContextBudgets,
    ) -> Self {
        Self {
            store,
            llm,
            budgets,
        }
    }

    /// Resolve, clean and bound a document's context for one mode.
    async fn context_for(
        &self,
        document_id: &str,
        budget: usize,
    ) -> Result<ResolvedContext, PipelineError> {
        let resolved = context::ensure_content(self.store.as_ref(), document_id).await?;
        let cleaned = context::clean(&resolved.text);
        let bounded = context::bound(&cleaned, budget).to_string();
        debug!(
            "Context for {document_id}: {} chars after cleaning, {} after bounding",
            cleaned.len(),
            bounded.len()
        );
        Ok(ResolvedContext {
            text: bounded,
            language: resolved.language,
        })
    }

    async fn complete_text(
        &self,
        mode: &str,
        messages: Vec<Message>,
    ) -> Result<String, PipelineError> {
        let raw = self.llm.complete(messages, false).await?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            warn!("Empty model response in {mode} mode");
            return Err(PipelineError::EmptyResponse);
        }
        Ok(trimmed.to_string())
    }

    async fn complete_items<T: DeserializeOwned>(
        &self,
        mode: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<T>, PipelineError> {
        let raw = self.llm.complete(messages, true).await?;
        let items = parse_structured::<T>(&raw)?;
        info!("{mode}: parsed {} item(s)", items.len());
        Ok(items)
    }

    // ========================================================================
    // Free-text modes
    // ========================================================================

    /// Generate (or regenerate) the document's summary. One summary per
    /// document; regeneration overwrites it in place.
    pub async fn summary(&self, document_id: &str) -> Result<Summary, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.chat).await?;
        let messages = prompts::summary(&ctx.language, &ctx.text);
        let content = self.complete_text("summary", messages).await?;

        let summary = self
            .store
            .upsert_summary(Summary::new(document_id, content))
            .await?;
        info!(
            "Summary for {document_id}: {} chars, ~{} min read",
            summary.content.len(),
            summary.reading_time_minutes
        );
        Ok(summary)
    }

    /// Continue the student's in-progress sentence, grounded in a small
    /// slice of the document.
    pub async fn autocomplete(
        &self,
        document_id: &str,
        typed: &str,
    ) -> Result<String, PipelineError> {
        let ctx = self
            .context_for(document_id, self.budgets.autocomplete)
            .await?;
        let messages = prompts::autocomplete(&ctx.language, typed, &ctx.text);
        self.complete_text("autocomplete", messages).await
    }

    // ========================================================================
    // Structured modes
    // ========================================================================

    pub async fn flashcards(&self, document_id: &str) -> Result<Vec<Flashcard>, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.study).await?;
        let messages = prompts::flashcards(&ctx.language, &ctx.text);
        let mut cards: Vec<Flashcard> = self.complete_items("flashcards", messages).await?;
        for card in &mut cards {
            card.document_id = document_id.to_string();
        }
        self.store
            .replace_flashcards(document_id, cards.clone())
            .await?;
        Ok(cards)
    }

    pub async fn quiz(&self, document_id: &str) -> Result<Vec<QuizQuestion>, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.study).await?;
        let messages = prompts::quiz(&ctx.language, &ctx.text);
        let mut questions: Vec<QuizQuestion> = self.complete_items("quiz", messages).await?;
        for q in &mut questions {
            q.document_id = document_id.to_string();
        }
        self.store
            .replace_questions(document_id, questions.clone())
            .await?;
        Ok(questions)
    }

    pub async fn notes(&self, document_id: &str) -> Result<Vec<Note>, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.study).await?;
        let messages = prompts::notes(&ctx.language, &ctx.text);
        let mut notes: Vec<Note> = self.complete_items("notes", messages).await?;
        for note in &mut notes {
            note.document_id = document_id.to_string();
        }
        self.store.replace_notes(document_id, notes.clone()).await?;
        Ok(notes)
    }

    pub async fn glossary(&self, document_id: &str) -> Result<Vec<GlossaryTerm>, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.study).await?;
        let messages = prompts::glossary(&ctx.language, &ctx.text);
        let mut terms: Vec<GlossaryTerm> = self.complete_items("glossary", messages).await?;
        for term in &mut terms {
            term.document_id = document_id.to_string();
        }
        self.store.replace_terms(document_id, terms.clone()).await?;
        Ok(terms)
    }

    pub async fn exam_predictions(
        &self,
        document_id: &str,
    ) -> Result<Vec<ExamPrediction>, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.study).await?;
        let messages = prompts::exam_predictions(&ctx.language, &ctx.text);
        let mut predictions: Vec<ExamPrediction> =
            self.complete_items("exam_predictions", messages).await?;
        for p in &mut predictions {
            p.document_id = document_id.to_string();
        }
        self.store
            .replace_predictions(document_id, predictions.clone())
            .await?;
        Ok(predictions)
    }

    pub async fn complex_topics(
        &self,
        document_id: &str,
    ) -> Result<Vec<ComplexTopic>, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.chat).await?;
        let messages = prompts::complex_topics(&ctx.language, &ctx.text);
        let mut topics: Vec<ComplexTopic> = self.complete_items("complex_topics", messages).await?;
        for t in &mut topics {
            t.document_id = document_id.to_string();
        }
        self.store
            .replace_topics(document_id, topics.clone())
            .await?;
        Ok(topics)
    }

    // ========================================================================
    // Weak points
    // ========================================================================

    /// Targeted lesson for a concept the student keeps getting wrong.
    /// Cache before compute: an existing lesson is returned without a model
    /// call. Requesting a lesson for a never-mistaken concept still creates
    /// the tracking record.
    pub async fn repair_lesson(
        &self,
        document_id: &str,
        concept: &str,
    ) -> Result<WeakPoint, PipelineError> {
        if let Some(point) = self.store.find_weak_point(document_id, concept).await? {
            if point.repair_lesson.is_some() {
                info!("Repair lesson cache hit for {document_id}/{concept}");
                return Ok(point);
            }
        }

        let ctx = self.context_for(document_id, self.budgets.study).await?;
        let messages = prompts::repair_lesson(&ctx.language, concept, &ctx.text);
        let lesson = self.complete_text("repair_lesson", messages).await?;

        let mut point = self
            .store
            .find_weak_point(document_id, concept)
            .await?
            .unwrap_or_else(|| WeakPoint::new(document_id, concept));
        point.repair_lesson = Some(lesson);
        Ok(self.store.upsert_weak_point(point).await?)
    }

    /// Record one mistake for (document, concept). A repeated mistake on a
    /// mastered concept un-masters it.
    pub async fn record_mistake(
        &self,
        document_id: &str,
        concept: &str,
    ) -> Result<WeakPoint, PipelineError> {
        self.require_document(document_id).await?;

        let point = match self.store.find_weak_point(document_id, concept).await? {
            Some(mut existing) => {
                existing.mistake_count += 1;
                existing.last_mistake = Utc::now();
                existing.status = WeakPointStatus::NeedsWork;
                existing
            }
            None => WeakPoint::new(document_id, concept),
        };

        info!(
            "Mistake recorded for {document_id}/{concept}: count={}",
            point.mistake_count
        );
        Ok(self.store.upsert_weak_point(point).await?)
    }

    /// Mark a concept as mastered. Only this explicit action transitions
    /// status away from Needs Work.
    pub async fn resolve_weak_point(
        &self,
        document_id: &str,
        concept: &str,
    ) -> Result<WeakPoint, PipelineError> {
        let mut point = self
            .store
            .find_weak_point(document_id, concept)
            .await?
            .ok_or_else(|| {
                PipelineError::NotFound(format!("weak point {document_id}/{concept}"))
            })?;
        point.status = WeakPointStatus::Mastered;
        Ok(self.store.upsert_weak_point(point).await?)
    }

    pub async fn weak_points(&self, document_id: &str) -> Result<Vec<WeakPoint>, PipelineError> {
        self.require_document(document_id).await?;
        Ok(self.store.weak_points_for(document_id).await?)
    }

    async fn require_document(&self, document_id: &str) -> Result<(), PipelineError> {
        self.store
            .get_document(document_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| PipelineError::NotFound(document_id.to_string()))
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Start a streaming chat turn. Failures before the first fragment
    /// surface here; failures mid-stream arrive as `Err` items on the
    /// stream and must be relayed in-band by the transport.
    pub async fn chat_stream(
        &self,
        document_id: &str,
        query: &str,
        history: &[ChatTurn],
    ) -> Result<TokenStream, PipelineError> {
        let ctx = self.context_for(document_id, self.budgets.chat).await?;
        let messages = prompts::chat(&ctx.language, &ctx.text, history, query);
        Ok(self.llm.complete_stream(messages).await?)
    }

    /// Blocking chat variant: consume the stream and join the fragments,
    /// so prompt construction exists in exactly one place.
    pub async fn chat(
        &self,
        document_id: &str,
        query: &str,
        history: &[ChatTurn],
    ) -> Result<String, PipelineError> {
        let mut stream = self.chat_stream(document_id, query, history).await?;
        let mut answer = String::new();
        while let Some(fragment) = stream.next().await {
            answer.push_str(&fragment?);
        }
        if answer.trim().is_empty() {
            return Err(PipelineError::EmptyResponse);
        }
        Ok(answer)
    }
}

// ============================================================================
// Tolerant structured-output parsing
// ============================================================================

/// Wrapper keys models are known to invent around the requested array.
const WRAPPER_KEYS: &[&str] = &[
    "items",
    "flashcards",
    "cards",
    "questions",
    "quiz",
    "notes",
    "terms",
    "glossary",
    "predictions",
    "topics",
    "data",
    "results",
];

/// Parse a model response expected to contain a JSON array of `T`.
/// Strategies tried in order: direct parse, known wrapper key, single-key
/// object, balanced array substring. JSON mode is not schema enforcing, so
/// wrapped arrays and stray prose around the payload are routine.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>, PipelineError> {
    let candidate = strip_code_fences(raw);

    if let Ok(items) = serde_json::from_str::<Vec<T>>(candidate) {
        return Ok(items);
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
        if let Some(items) = items_from_value(&value) {
            return Ok(items);
        }
    }

    if let Some(slice) = balanced_array(candidate) {
        if let Ok(items) = serde_json::from_str::<Vec<T>>(slice) {
            return Ok(items);
        }
    }

    Err(PipelineError::MalformedOutput(
        raw.chars().take(200).collect(),
    ))
}

fn items_from_value<T: DeserializeOwned>(value: &serde_json::Value) -> Option<Vec<T>> {
    match value {
        serde_json::Value::Array(_) => serde_json::from_value(value.clone()).ok(),
        serde_json::Value::Object(map) => {
            for key in WRAPPER_KEYS {
                if let Some(inner @ serde_json::Value::Array(_)) = map.get(*key) {
                    if let Ok(items) = serde_json::from_value(inner.clone()) {
                        return Some(items);
                    }
                }
            }
            // Last resort: an object with a single array field under an
            // unanticipated key.
            if map.len() == 1 {
                if let Some(inner @ serde_json::Value::Array(_)) = map.values().next() {
                    return serde_json::from_value(inner.clone()).ok();
                }
            }
            None
        }
        _ => None,
    }
}

/// Strip markdown code fences the model may have wrapped the JSON in.
fn strip_code_fences(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

/// Locate the first balanced `[...]` substring, skipping brackets inside
/// JSON strings.
fn balanced_array(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;
    use crate::schema::Document;
    use crate::store::MemoryStore;

    struct Fixture {
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        llm: Arc<MockLlm>,
        doc_id: String,
    }

    async fn pipeline_with(responses: Vec<&str>) -> (Pipeline, String, Arc<MockLlm>) {
        let fixture = fixture_with(responses).await;
        (fixture.pipeline, fixture.doc_id, fixture.llm)
    }

    async fn fixture_with(responses: Vec<&str>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(MockLlm::with_responses(responses));
        let mut doc = Document::new("bio-notes.txt".to_string());
        doc.extracted_text =
            "Photosynthesis converts light energy into chemical energy in plants.".to_string();
        let doc_id = doc.id.clone();
        store.create_document(doc).await.unwrap();
        let pipeline = Pipeline::new(store.clone(), llm.clone(), ContextBudgets::default());
        Fixture {
            pipeline,
            store,
            llm,
            doc_id,
        }
    }

    // ---- parse_structured ----

    #[test]
    fn parses_direct_array() {
        let cards: Vec<Flashcard> =
            parse_structured(r#"[{"front":"Q","back":"A"}]"#).unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].front, "Q");
    }

    #[test]
    fn parses_wrapper_object() {
        let cards: Vec<Flashcard> =
            parse_structured(r#"{"items":[{"front":"Q","back":"A"}]}"#).unwrap();
        assert_eq!(cards.len(), 1);

        let cards: Vec<Flashcard> =
            parse_structured(r#"{"flashcards":[{"front":"Q","back":"A"}]}"#).unwrap();
        assert_eq!(cards.len(), 1);
    }

    #[test]
    fn parses_unknown_single_key_wrapper() {
        let cards: Vec<Flashcard> =
            parse_structured(r#"{"study_cards":[{"front":"Q","back":"A"}]}"#).unwrap();
        assert_eq!(cards.len(), 1);
    }

    #[test]
    fn parses_fenced_block() {
        let raw = "```json\n[{\"front\":\"Q\",\"back\":\"A\"}]\n```";
        let cards: Vec<Flashcard> = parse_structured(raw).unwrap();
        assert_eq!(cards.len(), 1);
    }

    #[test]
    fn parses_array_embedded_in_prose() {
        let raw = r#"Here you go: [{"front":"Q","back":"A"}] Hope that helps!"#;
        let cards: Vec<Flashcard> = parse_structured(raw).unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].front, "Q");
        assert_eq!(cards[0].back, "A");
    }

    #[test]
    fn prose_with_brackets_inside_strings_still_parses() {
        let raw = r#"Sure [see below]: not it. [{"front":"a ] tricky [ one","back":"A"}]"#;
        // First bracket pair is prose; the balanced scan finds it first and
        // fails to parse, so the whole response is malformed. The strict
        // tiers never fire either.
        assert!(parse_structured::<Flashcard>(raw).is_err());

        let raw = r#"[{"front":"a ] tricky [ one","back":"A"}] extra prose"#;
        let cards: Vec<Flashcard> = parse_structured(raw).unwrap();
        assert_eq!(cards[0].front, "a ] tricky [ one");
    }

    #[test]
    fn garbage_is_malformed_output() {
        let err = parse_structured::<Flashcard>("I cannot answer that.").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedOutput(_)));
    }

    // ---- generators ----

    #[tokio::test]
    async fn flashcards_survive_prose_wrapped_output() {
        let (pipeline, id, _) = pipeline_with(vec![
            r#"Here you go: [{"front":"Q","back":"A"}] Hope that helps!"#,
        ])
        .await;

        let cards = pipeline.flashcards(&id).await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].document_id, id);
    }

    #[tokio::test]
    async fn malformed_output_persists_nothing() {
        let fixture = fixture_with(vec!["no json here at all"]).await;

        let err = fixture.pipeline.flashcards(&fixture.doc_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedOutput(_)));
        // "Never generated" stays distinguishable from "exists but empty".
        assert!(fixture
            .store
            .flashcards_for(&fixture.doc_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn summary_is_upserted_with_reading_time() {
        let (pipeline, id, _) = pipeline_with(vec!["First summary.", "Second summary."]).await;

        let first = pipeline.summary(&id).await.unwrap();
        let second = pipeline.summary(&id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "Second summary.");
        assert_eq!(second.reading_time_minutes, 1);
        assert_eq!(Summary::reading_time(2500), 3);
    }

    #[tokio::test]
    async fn empty_response_is_typed_error() {
        let (pipeline, id, _) = pipeline_with(vec!["   "]).await;
        let err = pipeline.summary(&id).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResponse));
    }

    #[tokio::test]
    async fn mistake_lifecycle() {
        let (pipeline, id, _) = pipeline_with(vec![]).await;

        let p1 = pipeline.record_mistake(&id, "Photosynthesis").await.unwrap();
        assert_eq!(p1.mistake_count, 1);
        assert_eq!(p1.status, WeakPointStatus::NeedsWork);

        let p2 = pipeline.record_mistake(&id, "Photosynthesis").await.unwrap();
        assert_eq!(p2.mistake_count, 2);
        assert_eq!(p2.status, WeakPointStatus::NeedsWork);

        let resolved = pipeline
            .resolve_weak_point(&id, "Photosynthesis")
            .await
            .unwrap();
        assert_eq!(resolved.status, WeakPointStatus::Mastered);

        // A repeated mistake un-masters the concept.
        let p3 = pipeline.record_mistake(&id, "Photosynthesis").await.unwrap();
        assert_eq!(p3.mistake_count, 3);
        assert_eq!(p3.status, WeakPointStatus::NeedsWork);
    }

    #[tokio::test]
    async fn resolving_unknown_concept_is_not_found() {
        let (pipeline, id, _) = pipeline_with(vec![]).await;
        let err = pipeline.resolve_weak_point(&id, "Unknown").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn repair_lesson_is_cached_after_first_generation() {
        let (pipeline, id, llm) = pipeline_with(vec!["Lesson: light reactions."]).await;

        let first = pipeline.repair_lesson(&id, "Light reactions").await.unwrap();
        assert_eq!(first.repair_lesson.as_deref(), Some("Lesson: light reactions."));
        assert_eq!(first.mistake_count, 1);
        assert_eq!(first.status, WeakPointStatus::NeedsWork);

        // Second request must not hit the model; the mock has no scripted
        // response left, so a call would error.
        let second = pipeline.repair_lesson(&id, "Light reactions").await.unwrap();
        assert_eq!(second.repair_lesson, first.repair_lesson);
        assert_eq!(llm.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chat_windows_history_before_the_model_call() {
        let (pipeline, id, llm) = pipeline_with(vec!["answer"]).await;
        let history: Vec<ChatTurn> = (0..10)
            .map(|i| ChatTurn {
                role: crate::schema::ChatRole::User,
                content: format!("turn {i}"),
            })
            .collect();

        let answer = pipeline.chat(&id, "question", &history).await.unwrap();
        assert_eq!(answer, "answer");

        let sent = llm.last_call();
        // persona + 2 priming turns + 6 history + query
        assert_eq!(sent.len(), 10);
        assert_eq!(sent[3].content, "turn 4");
        assert_eq!(sent[8].content, "turn 9");
    }

    #[tokio::test]
    async fn sync_chat_joins_stream_fragments() {
        let (pipeline, id, _) = pipeline_with(vec!["one two three"]).await;
        let answer = pipeline.chat(&id, "q", &[]).await.unwrap();
        assert_eq!(answer, "one two three");
    }

    #[tokio::test]
    async fn generation_blocked_without_content() {
        let store = Arc::new(MemoryStore::new());
        let doc = Document::new("empty.txt".to_string());
        let id = doc.id.clone();
        store.create_document(doc).await.unwrap();

        let pipeline = Pipeline::new(
            store,
            Arc::new(MockLlm::with_responses(vec!["unused"])),
            ContextBudgets::default(),
        );
        let err = pipeline.summary(&id).await.unwrap_err();
        assert!(matches!(err, PipelineError::ContentUnavailable(_)));
    }
}
