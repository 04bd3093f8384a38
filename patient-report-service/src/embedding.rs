use async_trait::async_trait;
use care_flow::{Embedder, FlowError, Result};
use tracing::info;

/// Local ONNX embedder. The model initialisation and inference are
/// off-loaded to a blocking thread so they don't obstruct Tokio's async
/// scheduler.
pub struct FastEmbedder;

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input = text.to_owned();

        let embedding = tokio::task::spawn_blocking(move || {
            use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

            let mut model = TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                    .with_show_download_progress(false),
            )?;
            let mut embeddings = model.embed(vec![input], None)?;
            embeddings
                .pop()
                .ok_or_else(|| anyhow::anyhow!("empty embedding batch"))
        })
        .await
        .map_err(|e| FlowError::UpstreamUnavailable(format!("embedding task failed: {e}")))?
        .map_err(|e: anyhow::Error| FlowError::UpstreamUnavailable(e.to_string()))?;

        info!(dimensions = embedding.len(), "text embedded");
        Ok(embedding)
    }
}
