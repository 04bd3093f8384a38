use async_trait::async_trait;
use care_flow::{ExtractedEntities, FlowError, PipelineStage, ProcessingState, Result, Stage};
use std::sync::Arc;
use tracing::{info, warn};

use super::extract_json_object;
use crate::llm::LlmClient;

const PARSE_PREAMBLE: &str =
    "You are a medical AI assistant. Extract structured medical information from patient notes.";

const STRICT_RETRY_INSTRUCTION: &str = "\n\nIMPORTANT: Your previous reply was not valid JSON. \
Respond with ONLY one JSON object matching the requested schema. No markdown fences, \
no commentary, no text before or after the JSON.";

fn parse_prompt(note: &str) -> String {
    format!(
        r#"Extract and return JSON with the following structure:
{{
    "chief_complaint": "primary reason for the visit",
    "diagnoses": ["list of diagnoses"],
    "medications": ["list of medications"],
    "symptoms": ["list of symptoms"],
    "lab_values": ["list of lab values"],
    "vital_signs": {{"blood_pressure": "value", "heart_rate": "value", "temperature": "value"}},
    "allergies": ["list of allergies"],
    "duration": "how long the complaint has been present"
}}

Patient Note: {note}

Return only valid JSON."#
    )
}

fn decode_entities(response: &str) -> Result<ExtractedEntities> {
    let json = extract_json_object(response)
        .ok_or_else(|| FlowError::Parse("no JSON object in LLM reply".to_string()))?;
    serde_json::from_str(json).map_err(|e| FlowError::Parse(e.to_string()))
}

/// Stage 1: free text to schema-validated entities. Malformed output
/// gets one retry with a stricter formatting instruction; the second
/// failure is a `Parse` error.
pub struct ParseStage {
    llm: Arc<dyn LlmClient>,
}

impl ParseStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl PipelineStage for ParseStage {
    fn id(&self) -> &str {
        "parse"
    }

    async fn run(&self, mut state: ProcessingState) -> Result<ProcessingState> {
        let prompt = parse_prompt(&state.note);
        let response = self.llm.complete(PARSE_PREAMBLE, &prompt).await?;

        let entities = match decode_entities(&response) {
            Ok(entities) => entities,
            Err(first_err) => {
                warn!(error = %first_err, "parse output malformed, retrying with strict instruction");
                let retry_prompt = format!("{prompt}{STRICT_RETRY_INSTRUCTION}");
                let retry = self.llm.complete(PARSE_PREAMBLE, &retry_prompt).await?;
                decode_entities(&retry)?
            }
        };

        info!(
            symptoms = entities.symptoms.len(),
            medications = entities.medications.len(),
            "note parsed into structured entities"
        );
        state.entities = Some(entities);
        Ok(state.with_stage(Stage::Parsed))
    }
}
