use care_flow::{
    FlowError, KnowledgeStore, PatientReport, Pipeline, PipelineConfig, ProcessingState, Result,
    RiskLevel, SessionStore, Stage, Turn, Urgency,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::directory::DirectoryClient;
use crate::llm::LlmClient;
use crate::models::ProcessNoteResponse;
use crate::stages::{EvaluateStage, ParseStage, SynthesizeStage};

pub const WORKFLOW_FULL: &str = "full_pipeline";
pub const WORKFLOW_MOCK: &str = "simple_mock";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub stage_timeout: Duration,
    pub retrieval_top_k: usize,
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            retrieval_top_k: 5,
            history_limit: 6,
        }
    }
}

impl OrchestratorConfig {
    /// Environment overrides in the form `STAGE_TIMEOUT_SECS`,
    /// `RETRIEVAL_TOP_K`, `HISTORY_LIMIT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = std::env::var("STAGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.stage_timeout.as_secs());
        Self {
            stage_timeout: Duration::from_secs(secs),
            retrieval_top_k: std::env::var("RETRIEVAL_TOP_K")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retrieval_top_k),
            history_limit: std::env::var("HISTORY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_limit),
        }
    }
}

pub fn build_note_pipeline(
    llm: Arc<dyn LlmClient>,
    knowledge: Arc<dyn KnowledgeStore>,
    config: &OrchestratorConfig,
) -> Pipeline {
    Pipeline::new(PipelineConfig {
        stage_timeout: config.stage_timeout,
    })
    .add_stage(Arc::new(ParseStage::new(llm.clone())))
    .add_stage(Arc::new(EvaluateStage::new(
        llm.clone(),
        knowledge,
        config.retrieval_top_k,
    )))
    .add_stage(Arc::new(SynthesizeStage::new(llm)))
}

/// Deterministic fallback used when the LLM backend is unavailable or
/// timing out: the caller still gets a bounded-latency reply, visibly
/// tagged as degraded.
fn mock_report(note: &str) -> PatientReport {
    let excerpt: String = note.chars().take(120).collect();
    PatientReport {
        patient_summary: format!(
            "We received your note (\"{excerpt}\") but could not run the full analysis \
             right now. Please review the points below and share the note with your doctor."
        ),
        key_points: vec![
            "Automated analysis is temporarily unavailable".to_string(),
            "Your note has been saved to this session".to_string(),
        ],
        recommendations: vec![
            "Discuss this note with your healthcare provider".to_string(),
            "Seek immediate care if your symptoms worsen".to_string(),
        ],
        questions_for_doctor: vec!["Can you review my recent note with me?".to_string()],
        follow_up_plan: Some("Try again later or contact your clinic directly".to_string()),
        risk_level: RiskLevel::Low,
        urgency: Urgency::Routine,
    }
}

/// Runs the fixed Parse -> Evaluate -> Synthesize pipeline per note,
/// serializing turns within a session and appending every terminal state
/// to session memory. The knowledge store is never mutated here.
pub struct NoteOrchestrator {
    pipeline: Pipeline,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn DirectoryClient>,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    config: OrchestratorConfig,
}

impl NoteOrchestrator {
    pub fn new(
        pipeline: Pipeline,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn DirectoryClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pipeline,
            sessions,
            directory,
            session_locks: DashMap::new(),
            config,
        }
    }

    /// Upper bound on the time `process` spends inside the pipeline.
    pub fn max_latency(&self) -> Duration {
        self.pipeline.max_latency()
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn process(
        &self,
        session_id: Option<String>,
        note: &str,
        patient_id: Option<&str>,
    ) -> Result<ProcessNoteResponse> {
        if note.trim().is_empty() {
            return Err(FlowError::Validation("note must not be empty".into()));
        }

        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Turns within one session run strictly in arrival order;
        // different sessions proceed concurrently.
        let lock = self.session_lock(&session_id);
        let guard = lock.lock().await;
        let result = self.process_locked(&session_id, note, patient_id).await;
        drop(guard);
        drop(lock);
        // Prune the lock entry unless another turn on this session still
        // holds a clone; otherwise the table grows with every session id
        // ever seen.
        self.session_locks
            .remove_if(&session_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn process_locked(
        &self,
        session_id: &str,
        note: &str,
        patient_id: Option<&str>,
    ) -> Result<ProcessNoteResponse> {
        let started = Instant::now();
        let mut state = ProcessingState::received(session_id, note);
        state.recent_history = self
            .sessions
            .history(session_id, self.config.history_limit)
            .await?;
        if let Some(pid) = patient_id {
            state.patient_name = self.directory.patient_display_name(pid).await;
        }

        let (terminal, workflow_type) = match self.pipeline.run(state.clone()).await {
            Ok(done) => (done, WORKFLOW_FULL),
            Err(e) if e.is_degradable() => {
                warn!(session_id = %session_id, error = %e, "degrading to mock responder");
                let mut mocked = state.with_stage(Stage::Mocked);
                mocked.report = Some(mock_report(note));
                mocked.error = Some(e.to_string());
                (mocked, WORKFLOW_MOCK)
            }
            Err(e) => {
                // A hard stage failure is still a recorded turn before it
                // surfaces to the caller.
                let failed = state.failed(e.to_string());
                self.append_turn(session_id, &failed, WORKFLOW_FULL).await?;
                return Err(e);
            }
        };

        self.append_turn(session_id, &terminal, workflow_type)
            .await?;

        info!(
            session_id = %session_id,
            workflow_type,
            stage = ?terminal.stage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "note processed"
        );

        Ok(ProcessNoteResponse {
            session_id: session_id.to_string(),
            report: terminal.report,
            processing_time: started.elapsed().as_secs_f64(),
            workflow_type: workflow_type.to_string(),
            stage: terminal.stage,
        })
    }

    async fn append_turn(
        &self,
        session_id: &str,
        state: &ProcessingState,
        workflow_type: &str,
    ) -> Result<()> {
        let summary = state
            .report
            .as_ref()
            .map(|r| r.patient_summary.clone())
            .or_else(|| state.error.clone());
        let turn = Turn::new(
            state.note.clone(),
            summary,
            workflow_type.to_string(),
            state.stage,
        );
        self.sessions.append(session_id, turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::NoopDirectory;
    use crate::llm::testing::ScriptedLlm;
    use crate::llm::UnavailableLlm;
    use care_flow::knowledge::testing::HistogramEmbedder;
    use care_flow::{InMemoryKnowledgeStore, InMemorySessionStore};

    const ENTITIES: &str = r#"{"chief_complaint": "hypertension", "diagnoses": ["hypertension"],
        "medications": ["metformin"], "lab_values": ["HbA1c 7.2%"]}"#;
    const EVALUATION: &str = r#"{"icd10_codes": ["I10"], "snomed_codes": [],
        "validation_notes": []}"#;
    const REPORT: &str = r#"{"patient_summary": "Your blood pressure needs attention.",
        "key_points": [], "recommendations": ["See your doctor"],
        "questions_for_doctor": [], "follow_up_plan": "Check again soon",
        "risk_level": "medium", "urgency": "soon"}"#;

    fn orchestrator(llm: Arc<dyn LlmClient>) -> (NoteOrchestrator, Arc<InMemorySessionStore>) {
        let sessions = Arc::new(InMemorySessionStore::default());
        let knowledge = Arc::new(InMemoryKnowledgeStore::new(Arc::new(HistogramEmbedder)));
        let config = OrchestratorConfig::default();
        let pipeline = build_note_pipeline(llm, knowledge, &config);
        (
            NoteOrchestrator::new(pipeline, sessions.clone(), Arc::new(NoopDirectory), config),
            sessions,
        )
    }

    #[tokio::test]
    async fn full_pipeline_produces_report_and_turn() {
        let (orchestrator, sessions) = orchestrator(Arc::new(ScriptedLlm::replying(&[
            ENTITIES, EVALUATION, REPORT,
        ])));

        let result = orchestrator
            .process(
                Some("s1".into()),
                "Patient has hypertension, taking metformin, HbA1c 7.2%",
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.workflow_type, WORKFLOW_FULL);
        assert_eq!(result.stage, Stage::Synthesized);
        let report = result.report.unwrap();
        assert!(!report.patient_summary.is_empty());

        let history = sessions.history("s1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].stage, Stage::Synthesized);
    }

    #[tokio::test]
    async fn unavailable_llm_degrades_to_mock() {
        let (orchestrator, sessions) = orchestrator(Arc::new(UnavailableLlm));

        let result = orchestrator
            .process(Some("s1".into()), "chest pain for two hours", None)
            .await
            .unwrap();

        assert_eq!(result.workflow_type, WORKFLOW_MOCK);
        assert_eq!(result.stage, Stage::Mocked);
        assert!(result.report.is_some());

        let history = sessions.history("s1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].stage, Stage::Mocked);
        assert_eq!(history[0].workflow_type, WORKFLOW_MOCK);
    }

    #[tokio::test]
    async fn empty_note_is_rejected() {
        let (orchestrator, _) = orchestrator(Arc::new(UnavailableLlm));
        let err = orchestrator
            .process(Some("s1".into()), "   ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[tokio::test]
    async fn parse_failure_records_failed_turn_and_surfaces_error() {
        let (orchestrator, sessions) = orchestrator(Arc::new(ScriptedLlm::replying(&[
            "not json",
            "still not json",
        ])));

        let err = orchestrator
            .process(Some("s1".into()), "a note", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Parse(_)));

        let history = sessions.history("s1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].stage, Stage::Failed);
    }

    #[tokio::test]
    async fn missing_session_id_creates_one() {
        let (orchestrator, _) = orchestrator(Arc::new(UnavailableLlm));
        let result = orchestrator.process(None, "a note", None).await.unwrap();
        assert!(!result.session_id.is_empty());
    }

    #[tokio::test]
    async fn identical_notes_yield_independent_turns() {
        let (orchestrator, sessions) = orchestrator(Arc::new(UnavailableLlm));
        orchestrator
            .process(Some("s1".into()), "same note", None)
            .await
            .unwrap();
        orchestrator
            .process(Some("s1".into()), "same note", None)
            .await
            .unwrap();

        let history = sessions.history("s1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].id, history[1].id);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_are_serialized() {
        let (orchestrator, sessions) = orchestrator(Arc::new(UnavailableLlm));
        let orchestrator = Arc::new(orchestrator);

        let mut handles = Vec::new();
        for i in 0..4 {
            let orch = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orch.process(Some("shared".into()), &format!("note {i}"), None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = sessions.history("shared", 10).await.unwrap();
        assert_eq!(history.len(), 4);
        // Timestamps must be monotonically non-decreasing under the
        // per-session lock.
        for pair in history.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
        assert!(orchestrator.session_locks.is_empty());
    }

    #[tokio::test]
    async fn lock_table_does_not_accumulate_finished_sessions() {
        let (orchestrator, _) = orchestrator(Arc::new(UnavailableLlm));
        for i in 0..10 {
            orchestrator
                .process(Some(format!("s{i}")), "a note", None)
                .await
                .unwrap();
        }
        assert!(orchestrator.session_locks.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_is_pruned_even_when_processing_fails() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedLlm::replying(&[
            "not json",
            "still not json",
        ])));
        orchestrator
            .process(Some("s1".into()), "a note", None)
            .await
            .unwrap_err();
        assert!(orchestrator.session_locks.is_empty());
    }

    #[test]
    fn mock_report_is_deterministic() {
        let a = mock_report("chest pain");
        let b = mock_report("chest pain");
        assert_eq!(a.patient_summary, b.patient_summary);
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert_eq!(a.urgency, Urgency::Routine);
    }
}
