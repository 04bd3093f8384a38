use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result};

/// Tag marking low-scored feedback documents; these are excluded from
/// default positive retrieval.
pub const NEGATIVE_EXEMPLAR_TAG: &str = "negative_exemplar";

/// Produces embedding vectors for text. Implementations live with the
/// service (fastembed in production, deterministic stubs in tests).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub category: String,
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Embedded,
    /// Embedding failed at write time; excluded from retrieval until
    /// re-embedded.
    Degraded,
}

/// Long-term knowledge entry. Immutable once written; corrections create
/// new documents rather than rewriting existing ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
    pub embedding_status: EmbeddingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: KnowledgeDocument,
    pub score: f32,
}

/// Embedded-document corpus with nearest-neighbour retrieval.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Embed `content` and store it. On embedding failure the document is
    /// stored flagged degraded rather than dropped.
    async fn upsert(&self, content: String, metadata: DocumentMetadata)
    -> Result<KnowledgeDocument>;

    /// The `k` nearest documents by similarity, ties broken by most
    /// recent creation time. Degraded and negative-exemplar documents are
    /// excluded.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredDocument>>;

    /// Retry embedding for degraded documents; returns how many
    /// recovered.
    async fn reembed_degraded(&self) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    async fn categories(&self) -> Result<Vec<String>>;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Brute-force in-memory index over `DashMap`. Reads iterate concurrently;
/// writes touch one document at a time with no cross-document locking.
pub struct InMemoryKnowledgeStore {
    documents: DashMap<String, KnowledgeDocument>,
    embedder: Arc<dyn Embedder>,
}

impl InMemoryKnowledgeStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            documents: DashMap::new(),
            embedder,
        }
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn upsert(
        &self,
        content: String,
        metadata: DocumentMetadata,
    ) -> Result<KnowledgeDocument> {
        let (embedding, status) = match self.embedder.embed(&content).await {
            Ok(vector) => (vector, EmbeddingStatus::Embedded),
            Err(e) => {
                warn!(error = %e, "embedding failed, storing document as degraded");
                (Vec::new(), EmbeddingStatus::Degraded)
            }
        };

        let document = KnowledgeDocument {
            id: Uuid::new_v4().to_string(),
            content,
            embedding,
            metadata,
            embedding_status: status,
            created_at: Utc::now(),
        };
        self.documents
            .insert(document.id.clone(), document.clone());
        Ok(document)
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredDocument>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(text).await?;

        let mut scored: Vec<ScoredDocument> = self
            .documents
            .iter()
            .filter(|entry| entry.embedding_status == EmbeddingStatus::Embedded)
            .filter(|entry| {
                !entry
                    .metadata
                    .tags
                    .iter()
                    .any(|t| t == NEGATIVE_EXEMPLAR_TAG)
            })
            .map(|entry| ScoredDocument {
                score: cosine_similarity(&query_embedding, &entry.embedding),
                document: entry.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.document.created_at.cmp(&a.document.created_at))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn reembed_degraded(&self) -> Result<usize> {
        let degraded: Vec<(String, String)> = self
            .documents
            .iter()
            .filter(|entry| entry.embedding_status == EmbeddingStatus::Degraded)
            .map(|entry| (entry.id.clone(), entry.content.clone()))
            .collect();

        let mut recovered = 0;
        for (id, content) in degraded {
            match self.embedder.embed(&content).await {
                Ok(vector) => {
                    if let Some(mut entry) = self.documents.get_mut(&id) {
                        entry.embedding = vector;
                        entry.embedding_status = EmbeddingStatus::Embedded;
                        recovered += 1;
                    }
                }
                Err(e) => {
                    warn!(document_id = %id, error = %e, "re-embedding still failing");
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "re-embedded degraded documents");
        }
        Ok(recovered)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.documents.len())
    }

    async fn categories(&self) -> Result<Vec<String>> {
        let set: BTreeSet<String> = self
            .documents
            .iter()
            .map(|entry| entry.metadata.category.clone())
            .collect();
        Ok(set.into_iter().collect())
    }
}

/// Deterministic embedders for tests. Kept out of `#[cfg(test)]` so
/// downstream crates can exercise the store without a real model.
pub mod testing {
    use super::*;

    /// Deterministic embedder: character histogram over a fixed alphabet.
    /// Near-identical texts land close in cosine space, which is all the
    /// retrieval tests need.
    pub struct HistogramEmbedder;

    #[async_trait]
    impl Embedder for HistogramEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vector = vec![0.0f32; 27];
            for c in text.to_lowercase().chars() {
                match c {
                    'a'..='z' => vector[(c as usize) - ('a' as usize)] += 1.0,
                    ' ' => vector[26] += 1.0,
                    _ => {}
                }
            }
            Ok(vector)
        }
    }

    /// Embedder that fails until `recover` is called.
    pub struct FlakyEmbedder {
        pub failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyEmbedder {
        pub fn failing() -> Self {
            Self {
                failing: std::sync::atomic::AtomicBool::new(true),
            }
        }

        pub fn recover(&self) {
            self.failing
                .store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                Err(FlowError::UpstreamUnavailable("embedder down".into()))
            } else {
                HistogramEmbedder.embed(text).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FlakyEmbedder, HistogramEmbedder};
    use super::*;

    fn metadata(category: &str) -> DocumentMetadata {
        DocumentMetadata {
            category: category.to_string(),
            source: "test".to_string(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn query_returns_nearest_document() {
        let store = InMemoryKnowledgeStore::new(Arc::new(HistogramEmbedder));
        store
            .upsert(
                "hypertension management protocol for adults".into(),
                metadata("cardiology"),
            )
            .await
            .unwrap();
        store
            .upsert(
                "pediatric fever supportive care guidance".into(),
                metadata("pediatrics"),
            )
            .await
            .unwrap();

        let results = store
            .query("hypertension management protocol", 1)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].document.content.contains("hypertension"));
        assert!(results[0].score > 0.8);
    }

    #[tokio::test]
    async fn ties_break_by_most_recent() {
        let store = InMemoryKnowledgeStore::new(Arc::new(HistogramEmbedder));
        let first = store
            .upsert("identical content".into(), metadata("a"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .upsert("identical content".into(), metadata("b"))
            .await
            .unwrap();

        let results = store.query("identical content", 2).await.unwrap();
        assert_eq!(results[0].document.id, second.id);
        assert_eq!(results[1].document.id, first.id);
    }

    #[tokio::test]
    async fn degraded_documents_are_stored_but_not_retrieved() {
        let embedder = Arc::new(FlakyEmbedder::failing());
        let store = InMemoryKnowledgeStore::new(embedder.clone());
        let doc = store
            .upsert("chest pain red flags".into(), metadata("cardiology"))
            .await
            .unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::Degraded);
        assert_eq!(store.count().await.unwrap(), 1);

        embedder.recover();
        let results = store.query("chest pain", 5).await.unwrap();
        assert!(results.is_empty());

        let recovered = store.reembed_degraded().await.unwrap();
        assert_eq!(recovered, 1);
        let results = store.query("chest pain", 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn negative_exemplars_excluded_from_default_retrieval() {
        let store = InMemoryKnowledgeStore::new(Arc::new(HistogramEmbedder));
        store
            .upsert(
                "bad advice example".into(),
                DocumentMetadata {
                    category: "user_feedback".into(),
                    source: "feedback".into(),
                    tags: vec![NEGATIVE_EXEMPLAR_TAG.to_string()],
                },
            )
            .await
            .unwrap();

        let results = store.query("bad advice example", 5).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn cosine_handles_zero_and_mismatched_vectors() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < f32::EPSILON);
    }
}
