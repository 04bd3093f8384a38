use axum::{
    Router,
    extract::{Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use care_flow::{FlowError, InMemoryKnowledgeStore, InMemorySessionStore, SessionStore};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::demo_data::load_demo_data;
use crate::directory::{DirectoryClient, HttpDirectoryClient, NoopDirectory};
use crate::embedding::FastEmbedder;
use crate::ingestion::{ChunkingConfig, ContentIngestor, UploadSubmission};
use crate::learning::LearningEngine;
use crate::llm::{LlmClient, OpenRouterClient, UnavailableLlm};
use crate::models::{LearnAndUpdateRequest, ProcessNoteRequest, UploadTextRequest};
use crate::workflow::{NoteOrchestrator, OrchestratorConfig, build_note_pipeline};

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn error_response(e: &FlowError) -> ApiError {
    let status = match e {
        FlowError::Validation(_) => StatusCode::BAD_REQUEST,
        FlowError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        FlowError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<NoteOrchestrator>,
    pub ingestor: Arc<ContentIngestor>,
    pub learning: Arc<LearningEngine>,
}

pub async fn create_app() -> Router {
    let app_state = create_app_state().await;
    build_router(app_state)
}

async fn create_app_state() -> AppState {
    let config = OrchestratorConfig::from_env();

    let llm: Arc<dyn LlmClient> = match OpenRouterClient::from_env() {
        Some(client) => Arc::new(client),
        None => {
            warn!("OPENROUTER_API_KEY not set; all notes will take the mock path");
            Arc::new(UnavailableLlm)
        }
    };

    let knowledge = Arc::new(InMemoryKnowledgeStore::new(Arc::new(FastEmbedder)));

    let session_ttl = Duration::from_secs(
        std::env::var("SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24 * 60 * 60),
    );
    let sessions: Arc<dyn SessionStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => match care_flow::PostgresSessionStore::connect(&url, session_ttl).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("failed to connect to postgres session store: {e}");
                std::process::exit(1);
            }
        },
        Err(_) => {
            info!("DATABASE_URL not set, using in-memory session store");
            Arc::new(InMemorySessionStore::new(session_ttl))
        }
    };

    // TTL enforcement is lazy on reads; this sweep keeps long-idle
    // sessions from accumulating in between.
    let eviction_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            match eviction_sessions.evict_expired().await {
                Ok(evicted) if evicted > 0 => info!(evicted, "expired sessions removed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "session eviction sweep failed"),
            }
        }
    });

    let directory: Arc<dyn DirectoryClient> = match std::env::var("CLINIC_SERVICE_URL") {
        Ok(base) => Arc::new(HttpDirectoryClient::new(base)),
        Err(_) => Arc::new(NoopDirectory),
    };

    let pipeline = build_note_pipeline(llm, knowledge.clone(), &config);
    let orchestrator = Arc::new(NoteOrchestrator::new(pipeline, sessions, directory, config));
    let ingestor = Arc::new(ContentIngestor::new(
        knowledge.clone(),
        ChunkingConfig::default(),
    ));
    let learning = Arc::new(LearningEngine::new(knowledge, ingestor.clone()));

    AppState {
        orchestrator,
        ingestor,
        learning,
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/process-note", post(process_note))
        .route("/learn-and-update", post(learn_and_update))
        .route("/upload-file", post(upload_file))
        .route("/upload-text", post(upload_text))
        .route("/load-demo-data", post(load_demo))
        .route("/uploaded-content", get(uploaded_content))
        .route("/learning-statistics", get(learning_statistics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Patient Report Service",
        "version": "1.0.0",
        "description": "Multi-stage AI pipeline turning clinical notes into patient-facing reports",
        "endpoints": {
            "POST /process-note": "Run a note through the parse/evaluate/synthesize pipeline",
            "POST /learn-and-update": "Submit feedback on a past interaction",
            "POST /upload-file": "Upload a file into the knowledge base (multipart)",
            "POST /upload-text": "Upload raw text into the knowledge base",
            "POST /load-demo-data": "Load the demo medical catalog",
            "GET /uploaded-content": "List uploaded content records",
            "GET /learning-statistics": "Aggregate learning statistics",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn process_note(
    State(state): State<AppState>,
    Json(request): Json<ProcessNoteRequest>,
) -> ApiResult<Value> {
    let result = state
        .orchestrator
        .process(
            request.session_id,
            &request.note,
            request.patient_id.as_deref(),
        )
        .await
        .map_err(|e| {
            error!("note processing failed: {e}");
            error_response(&e)
        })?;

    Ok(Json(json!({
        "session_id": result.session_id,
        "report": result.report,
        "processing_time": result.processing_time,
        "workflow_type": result.workflow_type,
        "stage": result.stage,
    })))
}

async fn learn_and_update(
    State(state): State<AppState>,
    Json(request): Json<LearnAndUpdateRequest>,
) -> ApiResult<Value> {
    let record = state.learning.submit(request).await.map_err(|e| {
        error!("feedback submission failed: {e}");
        error_response(&e)
    })?;

    Ok(Json(json!({
        "status": "learned",
        "feedback_id": record.id,
    })))
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Value> {
    let mut content: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut category: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut uploader: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error_response(&FlowError::Validation(format!("malformed multipart body: {e}")))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if filename.is_none() {
                    filename = field.file_name().map(|f| f.to_string());
                }
                let bytes = field.bytes().await.map_err(|e| {
                    error_response(&FlowError::Validation(format!("failed to read file: {e}")))
                })?;
                content = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            "filename" => filename = Some(read_text_field(field).await?),
            "content_type" => content_type = Some(read_text_field(field).await?),
            "category" => category = Some(read_text_field(field).await?),
            "tags" => {
                tags = read_text_field(field)
                    .await?
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
            }
            "uploader" => uploader = Some(read_text_field(field).await?),
            _ => {}
        }
    }

    let content = content.ok_or_else(|| {
        error_response(&FlowError::Validation("missing file field".to_string()))
    })?;
    let title = filename
        .clone()
        .unwrap_or_else(|| "uploaded_file".to_string());

    let submission = UploadSubmission {
        title,
        content,
        content_type,
        filename,
        category: category.unwrap_or_else(|| "general".to_string()),
        tags,
        source: uploader.unwrap_or_else(|| "file_upload".to_string()),
    };

    let record = state.ingestor.accept(submission).await.map_err(|e| {
        error!("file upload failed: {e}");
        error_response(&e)
    })?;

    Ok(Json(json!({
        "status": "processed",
        "record_id": record.id,
        "insights": record.insights,
        "documents_created": record.document_ids.len(),
    })))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field.text().await.map_err(|e| {
        error_response(&FlowError::Validation(format!(
            "failed to read multipart field: {e}"
        )))
    })
}

async fn upload_text(
    State(state): State<AppState>,
    Json(request): Json<UploadTextRequest>,
) -> ApiResult<Value> {
    let submission =
        UploadSubmission::from_text(request.title, request.content, request.metadata);

    let record = state.ingestor.accept(submission).await.map_err(|e| {
        error!("text upload failed: {e}");
        error_response(&e)
    })?;

    Ok(Json(json!({
        "status": "processed",
        "record_id": record.id,
        "insights": record.insights,
        "documents_created": record.document_ids.len(),
    })))
}

async fn load_demo(State(state): State<AppState>) -> ApiResult<Value> {
    info!("loading demo medical catalog");
    let recovered = state.ingestor.retry_degraded().await.unwrap_or(0);
    if recovered > 0 {
        info!(recovered, "re-embedded previously degraded documents");
    }
    let result = load_demo_data(state.ingestor.clone()).await;
    Ok(Json(json!({ "result": result })))
}

async fn uploaded_content(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(Json(json!({ "items": state.ingestor.list() })))
}

async fn learning_statistics(State(state): State<AppState>) -> ApiResult<Value> {
    let stats = state.learning.statistics().await.map_err(|e| {
        error!("statistics computation failed: {e}");
        error_response(&e)
    })?;
    Ok(Json(serde_json::to_value(stats).unwrap_or(Value::Null)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use care_flow::knowledge::testing::HistogramEmbedder;

    pub(crate) fn test_state() -> AppState {
        let config = OrchestratorConfig::default();
        let knowledge = Arc::new(InMemoryKnowledgeStore::new(Arc::new(HistogramEmbedder)));
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::default());
        let pipeline = build_note_pipeline(Arc::new(UnavailableLlm), knowledge.clone(), &config);
        let orchestrator = Arc::new(NoteOrchestrator::new(
            pipeline,
            sessions,
            Arc::new(NoopDirectory),
            config,
        ));
        let ingestor = Arc::new(ContentIngestor::new(
            knowledge.clone(),
            ChunkingConfig::default(),
        ));
        let learning = Arc::new(LearningEngine::new(knowledge, ingestor.clone()));
        AppState {
            orchestrator,
            ingestor,
            learning,
        }
    }

    #[tokio::test]
    async fn process_note_degrades_but_succeeds_without_llm() {
        let state = test_state();
        let response = process_note(
            State(state),
            Json(ProcessNoteRequest {
                session_id: Some("s1".into()),
                note: "Patient has hypertension, taking metformin, HbA1c 7.2%".into(),
                patient_id: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.0["workflow_type"], "simple_mock");
        assert!(response.0["report"]["patient_summary"].is_string());
    }

    #[tokio::test]
    async fn empty_note_maps_to_bad_request() {
        let state = test_state();
        let err = process_note(
            State(state),
            Json(ProcessNoteRequest {
                session_id: None,
                note: "".into(),
                patient_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_then_statistics_scenario() {
        let state = test_state();

        let upload = upload_text(
            State(state.clone()),
            Json(UploadTextRequest {
                content: "Hypertension protocol: monitor blood pressure, reduce sodium, \
                          review patient medication regularly."
                    .into(),
                title: "Hypertension Protocol".into(),
                metadata: crate::models::UploadMetadata {
                    content_type: Some("plaintext".into()),
                    category: Some("cardiology".into()),
                    tags: vec![],
                    uploader: None,
                },
            }),
        )
        .await
        .unwrap();
        assert_eq!(upload.0["status"], "processed");

        let listed = uploaded_content(State(state.clone())).await.unwrap();
        assert_eq!(listed.0["items"].as_array().unwrap().len(), 1);

        let stats = learning_statistics(State(state)).await.unwrap();
        assert!(stats.0["knowledge_base_size"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn invalid_feedback_score_maps_to_bad_request() {
        let state = test_state();
        let err = learn_and_update(
            State(state),
            Json(LearnAndUpdateRequest {
                interaction_type: "note_processing".into(),
                user_input: "a note".into(),
                ai_response: "a report".into(),
                feedback_score: 9.0,
                medical_context: None,
                learning_notes: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn demo_load_reports_catalog_counts() {
        let state = test_state();
        let response = load_demo(State(state)).await.unwrap();
        let result = &response.0["result"];
        assert_eq!(
            result["successful_loads"].as_u64().unwrap(),
            result["total_documents"].as_u64().unwrap()
        );
        assert_eq!(result["failed_loads"].as_u64().unwrap(), 0);
    }
}
