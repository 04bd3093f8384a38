use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{FlowError, Result};
use crate::state::ProcessingState;

/// One pipeline stage: a pure transformation of the processing state.
/// Stages never touch session memory; side effects belong to the caller.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Unique identifier for this stage.
    fn id(&self) -> &str;

    /// Run the stage, returning the advanced state.
    async fn run(&self, state: ProcessingState) -> Result<ProcessingState>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded timeout applied to every stage; total pipeline latency is
    /// at most `stage_timeout * stages.len()`.
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
        }
    }
}

/// Fixed ordered list of stages driven by one controller loop, so
/// timeout handling and the stage-transition invariant are uniform.
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            stages: Vec::new(),
            config,
        }
    }

    pub fn add_stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Maximum wall-clock time a caller can observe from `run`.
    pub fn max_latency(&self) -> Duration {
        self.config.stage_timeout * self.stages.len() as u32
    }

    /// Execute all stages in order. The first error short-circuits the
    /// remaining stages and is returned to the caller, which decides
    /// whether to degrade or fail.
    pub async fn run(&self, mut state: ProcessingState) -> Result<ProcessingState> {
        for stage in &self.stages {
            let before = state.stage;
            info!(stage_id = stage.id(), session_id = %state.session_id, "running pipeline stage");

            let next = match tokio::time::timeout(self.config.stage_timeout, stage.run(state)).await
            {
                Err(_) => {
                    warn!(stage_id = stage.id(), "stage timed out");
                    return Err(FlowError::UpstreamTimeout(format!(
                        "stage {} exceeded {:?}",
                        stage.id(),
                        self.config.stage_timeout
                    )));
                }
                Ok(Err(e)) => {
                    warn!(stage_id = stage.id(), error = %e, "stage failed");
                    return Err(e);
                }
                Ok(Ok(next)) => next,
            };

            if !before.can_advance_to(next.stage) {
                return Err(FlowError::StageFailed(format!(
                    "stage {} produced illegal transition {:?} -> {:?}",
                    stage.id(),
                    before,
                    next.stage
                )));
            }
            state = next;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Stage;

    struct AdvanceStage {
        id: String,
        to: Stage,
    }

    #[async_trait]
    impl PipelineStage for AdvanceStage {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self, state: ProcessingState) -> Result<ProcessingState> {
            Ok(state.with_stage(self.to))
        }
    }

    struct SlowStage;

    #[async_trait]
    impl PipelineStage for SlowStage {
        fn id(&self) -> &str {
            "slow"
        }

        async fn run(&self, state: ProcessingState) -> Result<ProcessingState> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(state.with_stage(Stage::Parsed))
        }
    }

    fn three_stage_pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default())
            .add_stage(Arc::new(AdvanceStage {
                id: "parse".into(),
                to: Stage::Parsed,
            }))
            .add_stage(Arc::new(AdvanceStage {
                id: "evaluate".into(),
                to: Stage::Evaluated,
            }))
            .add_stage(Arc::new(AdvanceStage {
                id: "synthesize".into(),
                to: Stage::Synthesized,
            }))
    }

    #[tokio::test]
    async fn runs_stages_in_order_to_terminal_state() {
        let pipeline = three_stage_pipeline();
        let state = ProcessingState::received("s1", "note");
        let out = pipeline.run(state).await.unwrap();
        assert_eq!(out.stage, Stage::Synthesized);
    }

    #[tokio::test]
    async fn stage_error_short_circuits() {
        struct FailStage;

        #[async_trait]
        impl PipelineStage for FailStage {
            fn id(&self) -> &str {
                "fail"
            }
            async fn run(&self, _state: ProcessingState) -> Result<ProcessingState> {
                Err(FlowError::StageFailed("boom".into()))
            }
        }

        let pipeline = Pipeline::new(PipelineConfig::default())
            .add_stage(Arc::new(AdvanceStage {
                id: "parse".into(),
                to: Stage::Parsed,
            }))
            .add_stage(Arc::new(FailStage))
            .add_stage(Arc::new(AdvanceStage {
                id: "synthesize".into(),
                to: Stage::Synthesized,
            }));

        let err = pipeline
            .run(ProcessingState::received("s1", "note"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::StageFailed(_)));
    }

    #[tokio::test]
    async fn timeout_maps_to_upstream_timeout() {
        let pipeline = Pipeline::new(PipelineConfig {
            stage_timeout: Duration::from_millis(20),
        })
        .add_stage(Arc::new(SlowStage));

        let err = pipeline
            .run(ProcessingState::received("s1", "note"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UpstreamTimeout(_)));
        assert!(err.is_degradable());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        // A stage that jumps straight to Synthesized from Received.
        let pipeline = Pipeline::new(PipelineConfig::default()).add_stage(Arc::new(AdvanceStage {
            id: "jump".into(),
            to: Stage::Synthesized,
        }));

        let err = pipeline
            .run(ProcessingState::received("s1", "note"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::StageFailed(_)));
    }
}
