use care_flow::{DocumentMetadata, FlowError, KnowledgeStore, NEGATIVE_EXEMPLAR_TAG, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::ingestion::ContentIngestor;
use crate::models::{FeedbackRecord, LearnAndUpdateRequest, LearningStatistics};

/// Scores at or below this are recorded as negative exemplars and kept
/// out of default positive retrieval.
const NEGATIVE_SCORE_CUTOFF: f64 = 2.0;

/// Turns user ratings on past interactions into knowledge entries and
/// recomputes the aggregate learning statistics.
pub struct LearningEngine {
    knowledge: Arc<dyn KnowledgeStore>,
    ingestor: Arc<ContentIngestor>,
    feedback: RwLock<Vec<FeedbackRecord>>,
}

impl LearningEngine {
    pub fn new(knowledge: Arc<dyn KnowledgeStore>, ingestor: Arc<ContentIngestor>) -> Self {
        Self {
            knowledge,
            ingestor,
            feedback: RwLock::new(Vec::new()),
        }
    }

    pub async fn submit(&self, request: LearnAndUpdateRequest) -> Result<FeedbackRecord> {
        if !(1.0..=5.0).contains(&request.feedback_score) {
            return Err(FlowError::Validation(format!(
                "feedback_score must be within [1, 5], got {}",
                request.feedback_score
            )));
        }
        if request.user_input.trim().is_empty() {
            return Err(FlowError::Validation("user_input must not be empty".into()));
        }
        if request.ai_response.trim().is_empty() {
            return Err(FlowError::Validation("ai_response must not be empty".into()));
        }

        let record = FeedbackRecord {
            id: Uuid::new_v4().to_string(),
            interaction_type: request.interaction_type.clone(),
            user_input: request.user_input.clone(),
            ai_response: request.ai_response.clone(),
            score: request.feedback_score,
            medical_context: request.medical_context.clone(),
            learning_notes: request.learning_notes.clone(),
            created_at: Utc::now(),
        };

        let mut tags = vec![format!("score_{}", request.feedback_score as i64)];
        if request.feedback_score <= NEGATIVE_SCORE_CUTOFF {
            tags.push(NEGATIVE_EXEMPLAR_TAG.to_string());
        }

        let mut content = format!(
            "Interaction ({}): {}\nResponse: {}",
            request.interaction_type, request.user_input, request.ai_response
        );
        if let Some(context) = &request.medical_context {
            content.push_str(&format!("\nContext: {context}"));
        }
        if let Some(notes) = &request.learning_notes {
            content.push_str(&format!("\nNotes: {notes}"));
        }

        self.knowledge
            .upsert(
                content,
                DocumentMetadata {
                    category: "user_feedback".to_string(),
                    source: "feedback_loop".to_string(),
                    tags,
                },
            )
            .await?;

        self.feedback.write().await.push(record.clone());
        info!(
            score = request.feedback_score,
            interaction_type = %request.interaction_type,
            "feedback recorded and knowledge base extended"
        );
        Ok(record)
    }

    pub async fn feedback_records(&self) -> Vec<FeedbackRecord> {
        self.feedback.read().await.clone()
    }

    /// Statistics are a pure function of the stores; nothing here is
    /// incremented in place.
    pub async fn statistics(&self) -> Result<LearningStatistics> {
        let feedback = self.feedback.read().await;
        let feedback_count = feedback.len();
        let average_feedback_score = if feedback_count == 0 {
            None
        } else {
            Some(feedback.iter().map(|f| f.score).sum::<f64>() / feedback_count as f64)
        };
        let last_feedback_at = feedback.iter().map(|f| f.created_at).max();
        drop(feedback);

        let last_training_date = match (self.ingestor.last_processed_at(), last_feedback_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        Ok(LearningStatistics {
            total_documents_processed: self.ingestor.processed_count() + feedback_count,
            total_medical_terms_learned: self.ingestor.terms_learned(),
            knowledge_base_size: self.knowledge.count().await?,
            categories_covered: self.knowledge.categories().await?,
            feedback_count,
            average_feedback_score,
            last_training_date,
        })
    }
}
