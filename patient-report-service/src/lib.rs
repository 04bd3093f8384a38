pub mod demo_data;
pub mod directory;
pub mod embedding;
pub mod ingestion;
pub mod learning;
pub mod llm;
pub mod models;
pub mod service;
pub mod stages;
pub mod workflow;

pub use service::{AppState, build_router, create_app};
pub use workflow::{NoteOrchestrator, OrchestratorConfig, build_note_pipeline};
pub use models::*;
