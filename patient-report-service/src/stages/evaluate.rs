use async_trait::async_trait;
use care_flow::{
    FlowError, KnowledgeStore, PipelineStage, ProcessingState, Result, RetrievedSnippet,
    ScoredDocument, Stage,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::extract_json_object;
use crate::llm::LlmClient;

const EVALUATE_PREAMBLE: &str =
    "You are a medical AI validator. Validate structured medical data against medical standards.";

#[derive(Debug, Deserialize)]
struct EvaluationResponse {
    #[serde(default)]
    icd10_codes: Vec<String>,
    #[serde(default)]
    snomed_codes: Vec<String>,
    #[serde(default)]
    validation_notes: Vec<String>,
    #[serde(default)]
    inconsistencies: Vec<String>,
}

fn evaluate_prompt(entities_json: &str, snippets: &[RetrievedSnippet]) -> String {
    let reference_block = if snippets.is_empty() {
        "No reference material retrieved.".to_string()
    } else {
        snippets
            .iter()
            .map(|s| format!("[{}] {}", s.category, s.content))
            .collect::<Vec<_>>()
            .join("\n---\n")
    };

    format!(
        r#"Validate the structured data below and return JSON with:
{{
    "icd10_codes": ["suggested ICD-10 codes"],
    "snomed_codes": ["suggested SNOMED codes"],
    "validation_notes": ["validation findings"],
    "inconsistencies": ["contradictions or implausible values"]
}}

Structured Data: {entities_json}

Reference material from the knowledge base:
{reference_block}

Return only valid JSON."#
    )
}

/// Stage 2: grounds the parsed entities against the knowledge store and
/// maps them to coding-standard terms. The retrieval read gets one retry
/// on a degradable failure before the error propagates.
pub struct EvaluateStage {
    llm: Arc<dyn LlmClient>,
    knowledge: Arc<dyn KnowledgeStore>,
    top_k: usize,
}

impl EvaluateStage {
    pub fn new(llm: Arc<dyn LlmClient>, knowledge: Arc<dyn KnowledgeStore>, top_k: usize) -> Self {
        Self {
            llm,
            knowledge,
            top_k,
        }
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredDocument>> {
        match self.knowledge.query(query, self.top_k).await {
            Ok(docs) => Ok(docs),
            Err(e) if e.is_degradable() => {
                warn!(error = %e, "knowledge retrieval failed, retrying once");
                self.knowledge.query(query, self.top_k).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PipelineStage for EvaluateStage {
    fn id(&self) -> &str {
        "evaluate"
    }

    async fn run(&self, mut state: ProcessingState) -> Result<ProcessingState> {
        let entities = state
            .entities
            .as_ref()
            .ok_or_else(|| FlowError::StageFailed("evaluate requires parsed entities".into()))?;

        let query = entities.retrieval_text();
        let retrieved = if query.trim().is_empty() {
            Vec::new()
        } else {
            self.retrieve(&query).await?
        };
        info!(retrieved = retrieved.len(), "knowledge snippets retrieved");

        state.retrieved = retrieved
            .into_iter()
            .map(|scored| RetrievedSnippet {
                document_id: scored.document.id,
                content: scored.document.content,
                category: scored.document.metadata.category,
                score: scored.score,
            })
            .collect();

        let entities_json = serde_json::to_string(entities)
            .map_err(|e| FlowError::StageFailed(e.to_string()))?;
        let prompt = evaluate_prompt(&entities_json, &state.retrieved);
        let response = self.llm.complete(EVALUATE_PREAMBLE, &prompt).await?;

        let json = extract_json_object(&response)
            .ok_or_else(|| FlowError::Parse("no JSON object in evaluator reply".to_string()))?;
        let evaluation: EvaluationResponse =
            serde_json::from_str(json).map_err(|e| FlowError::Parse(e.to_string()))?;

        state
            .codes
            .insert("icd10".to_string(), evaluation.icd10_codes);
        state
            .codes
            .insert("snomed".to_string(), evaluation.snomed_codes);
        state.validation_notes = evaluation.validation_notes;
        state
            .validation_notes
            .extend(evaluation.inconsistencies.into_iter().map(|i| format!("inconsistency: {i}")));

        Ok(state.with_stage(Stage::Evaluated))
    }
}
