use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Processing stage of a note. Advances forward only; `Failed` and
/// `Mocked` are terminal, and `Mocked` is reachable only from `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Parsed,
    Evaluated,
    Synthesized,
    Mocked,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Synthesized | Stage::Mocked | Stage::Failed)
    }

    /// Forward-only transition check. Any non-terminal stage may fail;
    /// the mocked path never passes through the intermediate stages.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        match (self, next) {
            (Stage::Received, Stage::Parsed) => true,
            (Stage::Parsed, Stage::Evaluated) => true,
            (Stage::Evaluated, Stage::Synthesized) => true,
            (Stage::Received, Stage::Mocked) => true,
            (s, Stage::Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    Soon,
    Urgent,
    Emergency,
}

/// Structured entities the parse stage extracts from a free-text note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub chief_complaint: Option<String>,
    #[serde(default)]
    pub diagnoses: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub lab_values: Vec<String>,
    #[serde(default)]
    pub vital_signs: HashMap<String, String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl ExtractedEntities {
    /// Flat text rendering used as the retrieval query for the
    /// knowledge store.
    pub fn retrieval_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(cc) = &self.chief_complaint {
            parts.push(cc.clone());
        }
        parts.extend(self.diagnoses.iter().cloned());
        parts.extend(self.symptoms.iter().cloned());
        parts.extend(self.medications.iter().cloned());
        parts.extend(self.lab_values.iter().cloned());
        parts.join(" ")
    }
}

/// Patient-facing report produced by the synthesize stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientReport {
    pub patient_summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub questions_for_doctor: Vec<String>,
    #[serde(default)]
    pub follow_up_plan: Option<String>,
    pub risk_level: RiskLevel,
    pub urgency: Urgency,
}

/// A knowledge snippet retrieved for grounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedSnippet {
    pub document_id: String,
    pub content: String,
    pub category: String,
    pub score: f32,
}

/// One request/response pair recorded in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub note: String,
    pub summary: Option<String>,
    pub workflow_type: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(note: String, summary: Option<String>, workflow_type: String, stage: Stage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            note,
            summary,
            workflow_type,
            stage,
            created_at: Utc::now(),
        }
    }
}

/// The evolving state threaded through the pipeline. Each stage receives
/// the previous state and returns an advanced copy; the controller loop
/// enforces the forward-only stage invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub session_id: String,
    pub note: String,
    pub entities: Option<ExtractedEntities>,
    /// Coding system (e.g. "icd10", "snomed") to suggested codes.
    pub codes: HashMap<String, Vec<String>>,
    pub validation_notes: Vec<String>,
    pub retrieved: Vec<RetrievedSnippet>,
    /// Bounded recent session history, newest last.
    pub recent_history: Vec<Turn>,
    pub patient_name: Option<String>,
    pub report: Option<PatientReport>,
    pub stage: Stage,
    pub error: Option<String>,
}

impl ProcessingState {
    pub fn received(session_id: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            note: note.into(),
            entities: None,
            codes: HashMap::new(),
            validation_notes: Vec::new(),
            retrieved: Vec::new(),
            recent_history: Vec::new(),
            patient_name: None,
            report: None,
            stage: Stage::Received,
            error: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.stage = Stage::Failed;
        self.error = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_advances_forward_only() {
        assert!(Stage::Received.can_advance_to(Stage::Parsed));
        assert!(Stage::Parsed.can_advance_to(Stage::Evaluated));
        assert!(Stage::Evaluated.can_advance_to(Stage::Synthesized));
        assert!(!Stage::Parsed.can_advance_to(Stage::Received));
        assert!(!Stage::Synthesized.can_advance_to(Stage::Parsed));
        assert!(!Stage::Received.can_advance_to(Stage::Synthesized));
    }

    #[test]
    fn mocked_only_from_received() {
        assert!(Stage::Received.can_advance_to(Stage::Mocked));
        assert!(!Stage::Parsed.can_advance_to(Stage::Mocked));
        assert!(!Stage::Evaluated.can_advance_to(Stage::Mocked));
    }

    #[test]
    fn any_live_stage_can_fail() {
        assert!(Stage::Received.can_advance_to(Stage::Failed));
        assert!(Stage::Evaluated.can_advance_to(Stage::Failed));
        assert!(!Stage::Mocked.can_advance_to(Stage::Failed));
        assert!(!Stage::Failed.can_advance_to(Stage::Failed));
    }

    #[test]
    fn retrieval_text_concatenates_entities() {
        let entities = ExtractedEntities {
            chief_complaint: Some("chest pain".to_string()),
            diagnoses: vec!["hypertension".to_string()],
            medications: vec!["metformin".to_string()],
            ..Default::default()
        };
        let text = entities.retrieval_text();
        assert!(text.contains("chest pain"));
        assert!(text.contains("hypertension"));
        assert!(text.contains("metformin"));
    }
}
