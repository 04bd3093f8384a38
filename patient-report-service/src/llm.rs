use async_trait::async_trait;
use care_flow::{FlowError, Result};
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openrouter;
use tracing::warn;

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Completion seam for the three pipeline stages. Production talks to
/// OpenRouter through rig; tests script the responses; a missing API key
/// degrades every call to `UpstreamUnavailable` so the orchestrator's
/// mock path takes over.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String>;
}

pub struct OpenRouterClient {
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok()?;
        let model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Some(Self { api_key, model })
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String> {
        let client = openrouter::Client::new(&self.api_key);
        let agent = client.agent(&self.model).preamble(preamble).build();
        agent.prompt(prompt).await.map_err(|e| {
            warn!(error = %e, "LLM completion failed");
            FlowError::UpstreamUnavailable(e.to_string())
        })
    }
}

/// Stand-in used when no API key is configured: every call reports the
/// upstream as unavailable, which routes requests to the mock responder.
pub struct UnavailableLlm;

#[async_trait]
impl LlmClient for UnavailableLlm {
    async fn complete(&self, _preamble: &str, _prompt: &str) -> Result<String> {
        Err(FlowError::UpstreamUnavailable(
            "no LLM backend configured".to_string(),
        ))
    }
}
