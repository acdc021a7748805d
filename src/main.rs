//! Studykit - document-grounded study artifact generation server.

mod config;
mod context;
mod error;
mod extractor;
mod generator;
mod llm;
mod prompts;
mod schema;
mod store;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Settings;
use error::PipelineError;
use generator::Pipeline;
use llm::{OpenRouterClient, TokenStream};
use schema::{ChatTurn, Document};
use store::{MemoryStore, StudyStore};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    store: Arc<dyn StudyStore>,
    pipeline: Arc<Pipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studykit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env()?);
    tokio::fs::create_dir_all(&settings.upload_dir).await?;

    // One LLM client for the process lifetime, injected everywhere.
    let llm = Arc::new(OpenRouterClient::from_env()?);
    info!("OpenRouter client initialized");

    let store: Arc<dyn StudyStore> = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(Pipeline::new(store.clone(), llm, settings.budgets));

    let state = AppState {
        settings: settings.clone(),
        store,
        pipeline,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/documents", post(upload_document))
        .route("/documents/:id", get(get_document))
        .route("/documents/:id/ingest", post(ingest_document))
        .route("/documents/:id/generate/:mode", post(generate))
        .route("/documents/:id/chat", post(chat))
        .route("/documents/:id/summary", get(get_summary))
        .route("/documents/:id/flashcards", get(get_flashcards))
        .route("/documents/:id/quiz", get(get_quiz))
        .route("/documents/:id/notes", get(get_notes))
        .route("/documents/:id/glossary", get(get_glossary))
        .route("/documents/:id/predictions", get(get_predictions))
        .route("/documents/:id/complex-topics", get(get_topics))
        .route("/documents/:id/weak-points", get(get_weak_points))
        .route("/documents/:id/weak-points/resolve", post(resolve_weak_point))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024)) // 100MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

/// Upload a document. Phase 1 (durable) saves the file and creates the
/// record synchronously; phase 2 (best effort) extracts text in the
/// background. A failed extraction never fails the upload; the lazy
/// recovery path in the resolver is the correctness backstop.
async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Document>, (StatusCode, String)> {
    let mut filename = String::new();
    let mut declared_mime: Option<String> = None;
    let mut language: Option<String> = None;
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {e}")))?
    {
        match field.name() {
            Some("file") => {
                filename = field.file_name().unwrap_or("document").to_string();
                declared_mime = field.content_type().map(|s| s.to_string());
                file_data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {e}")))?
                    .to_vec();
            }
            Some("language") => {
                let value = field.text().await.unwrap_or_default();
                if !value.trim().is_empty() {
                    language = Some(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    let content_hash = {
        let mut hasher = Sha256::new();
        hasher.update(&file_data);
        format!("{:x}", hasher.finalize())
    };

    // Store under the content hash so re-uploads of identical bytes land on
    // the same path.
    let extension = std::path::Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let stored_path = state
        .settings
        .upload_dir
        .join(format!("{content_hash}{extension}"));
    tokio::fs::write(&stored_path, &file_data)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to store file: {e}"),
            )
        })?;

    let mime = extractor::infer_mime(declared_mime.as_deref(), &filename).to_string();
    info!(
        "Received file: {filename} ({} bytes, {mime}) -> {}",
        file_data.len(),
        stored_path.display()
    );

    let mut doc = Document::new(filename);
    doc.source_location = Some(stored_path.to_string_lossy().to_string());
    doc.mime_type = Some(mime);
    doc.language = language;
    doc.content_hash = Some(content_hash);

    state
        .store
        .create_document(doc.clone())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    // Phase 2: fire-and-forget extraction. The upload already succeeded.
    let store = state.store.clone();
    let doc_id = doc.id.clone();
    tokio::spawn(async move {
        match context::ingest(store.as_ref(), &doc_id).await {
            Ok(chunk_count) => {
                info!("Background extraction for {doc_id} complete: {chunk_count} chunk(s)")
            }
            Err(e) => error!("Background extraction for {doc_id} failed: {e}"),
        }
    });

    Ok(Json(doc))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, (StatusCode, String)> {
    state
        .store
        .get_document(&id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("document not found: {id}")))
}

/// Synchronous re-extraction; returns the chunk-count diagnostic.
async fn ingest_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let chunk_count = context::ingest(state.store.as_ref(), &id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "chunk_count": chunk_count })))
}

#[derive(Debug, Default, Deserialize)]
struct GenerateArgs {
    #[serde(default)]
    concept: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Dispatch one generation mode. Chat has its own streaming route.
async fn generate(
    State(state): State<AppState>,
    Path((id, mode)): Path<(String, String)>,
    args: Option<Json<GenerateArgs>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let Json(args) = args.unwrap_or_default();
    let pipeline = &state.pipeline;

    let result = match mode.as_str() {
        "summary" => pipeline.summary(&id).await.and_then(to_json),
        "flashcards" => pipeline.flashcards(&id).await.and_then(to_json),
        "quiz" => pipeline.quiz(&id).await.and_then(to_json),
        "notes" => pipeline.notes(&id).await.and_then(to_json),
        "glossary" => pipeline.glossary(&id).await.and_then(to_json),
        "exam-predictions" => pipeline.exam_predictions(&id).await.and_then(to_json),
        "complex-topics" => pipeline.complex_topics(&id).await.and_then(to_json),
        "repair-lesson" => {
            let concept = require_arg(args.concept, "concept")?;
            pipeline.repair_lesson(&id, &concept).await.and_then(to_json)
        }
        "mistake" => {
            let concept = require_arg(args.concept, "concept")?;
            pipeline.record_mistake(&id, &concept).await.and_then(to_json)
        }
        "autocomplete" => {
            let text = require_arg(args.text, "text")?;
            pipeline
                .autocomplete(&id, &text)
                .await
                .map(|completion| json!({ "completion": completion }))
        }
        other => {
            return Err((StatusCode::BAD_REQUEST, format!("Unknown mode: {other}")));
        }
    };

    result.map(Json).map_err(|e| {
        error!("Generation failed for {id} in {mode} mode: {e}");
        error_response(e)
    })
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value, PipelineError> {
    serde_json::to_value(value).map_err(|e| PipelineError::Generation(e.to_string()))
}

fn require_arg(value: Option<String>, name: &str) -> Result<String, (StatusCode, String)> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("Missing field: {name}")))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    query: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

/// Streaming chat. Failures before the first fragment map to an HTTP
/// error; once streaming has begun, a provider failure is relayed as one
/// in-band error frame because flushed output cannot be unsent.
async fn chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match state
        .pipeline
        .chat_stream(&id, &request.query, &request.history)
        .await
    {
        Ok(tokens) => {
            let events = chat_frames(tokens)
                .map(|data| Ok::<_, Infallible>(Event::default().data(data)));
            Sse::new(events).keep_alive(KeepAlive::default()).into_response()
        }
        Err(e) => {
            error!("Chat stream for {id} failed before start: {e}");
            error_response(e).into_response()
        }
    }
}

/// Translate the token stream into wire frames: `{"content": ...}` per
/// fragment, `[DONE]` exactly once on natural completion, or one
/// `{"error": ...}` frame then termination.
fn chat_frames(mut tokens: TokenStream) -> impl Stream<Item = String> {
    async_stream::stream! {
        while let Some(item) = tokens.next().await {
            match item {
                Ok(fragment) => {
                    yield json!({ "content": fragment }).to_string();
                }
                Err(e) => {
                    error!("Chat stream error after start: {e}");
                    yield json!({ "error": e.to_string() }).to_string();
                    return;
                }
            }
        }
        yield "[DONE]".to_string();
    }
}

// ============================================================================
// Artifact queries
// ============================================================================

async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.get_summary(&id).await, "summary")
}

async fn get_flashcards(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.flashcards_for(&id).await, "flashcards")
}

async fn get_quiz(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.questions_for(&id).await, "quiz")
}

async fn get_notes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.notes_for(&id).await, "notes")
}

async fn get_glossary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.terms_for(&id).await, "glossary")
}

async fn get_predictions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.predictions_for(&id).await, "predictions")
}

async fn get_topics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    artifact_or_404(state.store.topics_for(&id).await, "complex topics")
}

/// "Never generated" is a 404, distinct from a present-but-empty artifact;
/// callers treat it as "offer to generate".
fn artifact_or_404<T: serde::Serialize>(
    result: Result<Option<T>, store::StoreError>,
    kind: &str,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match result {
        Ok(Some(artifact)) => serde_json::to_value(artifact)
            .map(Json)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("no {kind} generated yet"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn get_weak_points(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .pipeline
        .weak_points(&id)
        .await
        .and_then(to_json)
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    concept: String,
}

async fn resolve_weak_point(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .pipeline
        .resolve_weak_point(&id, &request.concept)
        .await
        .and_then(to_json)
        .map(Json)
        .map_err(error_response)
}

// ============================================================================
// Error mapping
// ============================================================================

fn error_response(err: PipelineError) -> (StatusCode, String) {
    let status = match &err {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::ContentUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Extraction(_)
        | PipelineError::EmptyResponse
        | PipelineError::MalformedOutput(_)
        | PipelineError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;
    use crate::llm::{LlmClient, Message};

    async fn collect_frames(mock: MockLlm) -> Vec<String> {
        let tokens = mock.complete_stream(vec![Message::user("q")]).await.unwrap();
        chat_frames(tokens).collect().await
    }

    #[tokio::test]
    async fn stream_ends_with_done_exactly_once() {
        let frames = collect_frames(MockLlm::with_responses(vec!["hello there world"])).await;

        assert_eq!(frames.last().unwrap(), "[DONE]");
        assert_eq!(frames.iter().filter(|f| *f == "[DONE]").count(), 1);
        // Every other frame is a content payload.
        for frame in &frames[..frames.len() - 1] {
            let value: serde_json::Value = serde_json::from_str(frame).unwrap();
            assert!(value.get("content").is_some());
        }
    }

    #[tokio::test]
    async fn stream_relays_fragments_in_order() {
        let frames = collect_frames(MockLlm::with_responses(vec!["one two three"])).await;

        let joined: String = frames[..frames.len() - 1]
            .iter()
            .map(|f| {
                serde_json::from_str::<serde_json::Value>(f).unwrap()["content"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(joined, "one two three");
    }

    #[tokio::test]
    async fn mid_stream_error_becomes_in_band_frame() {
        let llm = MockLlm::with_responses(vec!["one two three"]).fail_stream_after(2);
        let frames = collect_frames(llm).await;

        // Two content frames, then the error frame, then nothing.
        assert_eq!(frames.len(), 3);
        let last: serde_json::Value = serde_json::from_str(frames.last().unwrap()).unwrap();
        assert!(last.get("error").is_some());
        assert!(!frames.iter().any(|f| f == "[DONE]"));
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            error_response(PipelineError::NotFound("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(PipelineError::ContentUnavailable("x".into())).0,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_response(PipelineError::EmptyResponse).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
