use async_trait::async_trait;
use care_flow::{
    FlowError, PatientReport, PipelineStage, ProcessingState, Result, Stage, Turn,
};
use std::sync::Arc;
use tracing::info;

use super::extract_json_object;
use crate::llm::LlmClient;

const SYNTHESIZE_PREAMBLE: &str =
    "You are a medical AI educator. Generate patient-friendly health reports in simple language.";

fn history_block(history: &[Turn]) -> String {
    if history.is_empty() {
        return "No earlier turns in this session.".to_string();
    }
    history
        .iter()
        .map(|turn| {
            let summary = turn.summary.as_deref().unwrap_or("(no summary recorded)");
            format!("- note: {} | report: {}", turn.note, summary)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn synthesize_prompt(state: &ProcessingState) -> Result<String> {
    let entities_json = serde_json::to_string(&state.entities)
        .map_err(|e| FlowError::StageFailed(e.to_string()))?;
    let codes_json =
        serde_json::to_string(&state.codes).map_err(|e| FlowError::StageFailed(e.to_string()))?;

    let snippets = if state.retrieved.is_empty() {
        "None.".to_string()
    } else {
        state
            .retrieved
            .iter()
            .map(|s| format!("[{}] {}", s.category, s.content))
            .collect::<Vec<_>>()
            .join("\n---\n")
    };

    let addressee = state
        .patient_name
        .as_deref()
        .map(|name| format!("Address the patient by name: {name}.\n"))
        .unwrap_or_default();

    Ok(format!(
        r#"{addressee}Create a comprehensive but simple report and return JSON with:
{{
    "patient_summary": "Simple explanation of findings",
    "key_points": ["main health points"],
    "recommendations": ["action items for patient"],
    "questions_for_doctor": ["questions patient should ask"],
    "follow_up_plan": "next steps",
    "risk_level": "low|medium|high",
    "urgency": "routine|soon|urgent|emergency"
}}

Validated Data: {entities_json}
Suggested Codes: {codes_json}
Validation Notes: {notes:?}

Relevant knowledge base material:
{snippets}

Recent session history:
{history}

Use simple language appropriate for patients. Return only valid JSON."#,
        notes = state.validation_notes,
        history = history_block(&state.recent_history),
    ))
}

/// Stage 3: validated entities + retrieved snippets + bounded session
/// history into the final patient-facing report.
pub struct SynthesizeStage {
    llm: Arc<dyn LlmClient>,
}

impl SynthesizeStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl PipelineStage for SynthesizeStage {
    fn id(&self) -> &str {
        "synthesize"
    }

    async fn run(&self, mut state: ProcessingState) -> Result<ProcessingState> {
        let prompt = synthesize_prompt(&state)?;
        let response = self.llm.complete(SYNTHESIZE_PREAMBLE, &prompt).await?;

        let json = extract_json_object(&response)
            .ok_or_else(|| FlowError::Parse("no JSON object in synthesizer reply".to_string()))?;
        let report: PatientReport =
            serde_json::from_str(json).map_err(|e| FlowError::Parse(e.to_string()))?;

        info!(
            risk_level = ?report.risk_level,
            urgency = ?report.urgency,
            "patient report synthesized"
        );
        state.report = Some(report);
        Ok(state.with_stage(Stage::Synthesized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use care_flow::{ExtractedEntities, RiskLevel, Urgency};

    const REPORT: &str = r#"{"patient_summary": "Your blood pressure is above the healthy range.",
        "key_points": ["Blood pressure is elevated"],
        "recommendations": ["Reduce salt intake"],
        "questions_for_doctor": ["Should I adjust my medication?"],
        "follow_up_plan": "Re-check in two weeks",
        "risk_level": "medium",
        "urgency": "soon"}"#;

    fn evaluated_state() -> ProcessingState {
        let mut state =
            ProcessingState::received("s1", "bp 150/95 at home").with_stage(Stage::Evaluated);
        state.entities = Some(ExtractedEntities::default());
        state
            .codes
            .insert("icd10".into(), vec!["I10".into()]);
        state
    }

    #[tokio::test]
    async fn produces_typed_report() {
        let stage = SynthesizeStage::new(Arc::new(ScriptedLlm::replying(&[REPORT])));
        let out = stage.run(evaluated_state()).await.unwrap();

        assert_eq!(out.stage, Stage::Synthesized);
        let report = out.report.unwrap();
        assert!(!report.patient_summary.is_empty());
        assert_eq!(report.risk_level, RiskLevel::Medium);
        assert_eq!(report.urgency, Urgency::Soon);
    }

    #[tokio::test]
    async fn invalid_risk_level_is_rejected() {
        let bad = r#"{"patient_summary": "ok", "risk_level": "catastrophic", "urgency": "routine"}"#;
        let stage = SynthesizeStage::new(Arc::new(ScriptedLlm::replying(&[bad])));
        let err = stage.run(evaluated_state()).await.unwrap_err();
        assert!(matches!(err, FlowError::Parse(_)));
    }

    #[test]
    fn history_block_renders_recent_turns() {
        let turns = vec![Turn::new(
            "earlier note".into(),
            Some("earlier summary".into()),
            "full_pipeline".into(),
            Stage::Synthesized,
        )];
        let block = history_block(&turns);
        assert!(block.contains("earlier note"));
        assert!(block.contains("earlier summary"));
    }
}
