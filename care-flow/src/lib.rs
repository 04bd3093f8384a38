pub mod error;
pub mod knowledge;
pub mod pipeline;
pub mod postgres;
pub mod session;
pub mod state;

// Re-export commonly used types
pub use error::{FlowError, Result};
pub use knowledge::{
    DocumentMetadata, Embedder, EmbeddingStatus, InMemoryKnowledgeStore, KnowledgeDocument,
    KnowledgeStore, NEGATIVE_EXEMPLAR_TAG, ScoredDocument,
};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStage};
pub use postgres::PostgresSessionStore;
pub use session::{InMemorySessionStore, SessionStore};
pub use state::{
    ExtractedEntities, PatientReport, ProcessingState, RetrievedSnippet, RiskLevel, Stage, Turn,
    Urgency,
};
