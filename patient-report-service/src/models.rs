use care_flow::{PatientReport, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ProcessNoteRequest {
    pub session_id: Option<String>,
    pub note: String,
    pub patient_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessNoteResponse {
    pub session_id: String,
    pub report: Option<PatientReport>,
    pub processing_time: f64,
    pub workflow_type: String,
    pub stage: Stage,
}

#[derive(Debug, Deserialize)]
pub struct LearnAndUpdateRequest {
    pub interaction_type: String,
    pub user_input: String,
    pub ai_response: String,
    pub feedback_score: f64,
    pub medical_context: Option<String>,
    pub learning_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadTextRequest {
    pub content: String,
    pub title: String,
    #[serde(default)]
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadMetadata {
    pub content_type: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub uploader: Option<String>,
}

/// Derived metrics for a piece of ingested content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentInsights {
    pub word_count: usize,
    pub character_count: usize,
    pub medical_terms_found: Vec<String>,
    pub key_topics: Vec<String>,
    /// 0..1, from length / term density / topic / structure factors.
    pub content_quality_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedContentRecord {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub insights: Option<ContentInsights>,
    pub status: UploadStatus,
    pub failure_reason: Option<String>,
    /// Knowledge documents derived from this upload, one per chunk.
    pub document_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub interaction_type: String,
    pub user_input: String,
    pub ai_response: String,
    pub score: f64,
    pub medical_context: Option<String>,
    pub learning_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Derived counters over the stores; recomputed, never mutated in place.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStatistics {
    pub total_documents_processed: usize,
    pub total_medical_terms_learned: usize,
    pub knowledge_base_size: usize,
    pub categories_covered: Vec<String>,
    pub feedback_count: usize,
    pub average_feedback_score: Option<f64>,
    pub last_training_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoLoadResult {
    pub total_documents: usize,
    pub successful_loads: usize,
    pub failed_loads: usize,
    pub categories_loaded: Vec<String>,
}
