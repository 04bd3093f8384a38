use care_flow::{DocumentMetadata, FlowError, KnowledgeStore, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{ContentInsights, UploadMetadata, UploadStatus, UploadedContentRecord};

/// Formats the ingestion pipeline accepts. All of them carry text by the
/// time they reach this service; binary extraction happens upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Plaintext,
    Markdown,
    PdfText,
    HtmlText,
    DocxText,
}

impl ContentFormat {
    /// Resolve from a declared content type, falling back to the
    /// filename extension.
    pub fn resolve(content_type: Option<&str>, filename: Option<&str>) -> Result<Self> {
        if let Some(declared) = content_type {
            return Self::from_label(declared);
        }
        if let Some(name) = filename {
            let ext = name.rsplit('.').next().unwrap_or_default();
            return Self::from_extension(ext)
                .ok_or_else(|| FlowError::UnsupportedFormat(format!(".{ext}")));
        }
        Ok(ContentFormat::Plaintext)
    }

    fn from_label(label: &str) -> Result<Self> {
        match label.trim().to_lowercase().as_str() {
            "plaintext" | "text" | "text/plain" | "txt" => Ok(ContentFormat::Plaintext),
            "markdown" | "md" | "text/markdown" => Ok(ContentFormat::Markdown),
            "pdf-text" | "pdf" | "application/pdf" => Ok(ContentFormat::PdfText),
            "html-text" | "html" | "text/html" => Ok(ContentFormat::HtmlText),
            "docx-text" | "docx" => Ok(ContentFormat::DocxText),
            other => Err(FlowError::UnsupportedFormat(other.to_string())),
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" => Some(ContentFormat::Plaintext),
            "md" | "markdown" => Some(ContentFormat::Markdown),
            "pdf" => Some(ContentFormat::PdfText),
            "html" | "htm" => Some(ContentFormat::HtmlText),
            "docx" => Some(ContentFormat::DocxText),
            _ => None,
        }
    }
}

/// Strip tags from HTML-ish text; scripts and styles drop entirely.
fn strip_html(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let lowered = after.to_lowercase();
        let close_target = if lowered.starts_with("<script") {
            Some("</script>")
        } else if lowered.starts_with("<style") {
            Some("</style>")
        } else {
            None
        };
        if let Some(closing) = close_target {
            match lowered.find(closing) {
                Some(pos) => {
                    rest = &after[pos..];
                    continue;
                }
                None => return out,
            }
        }
        match after.find('>') {
            Some(end) => {
                out.push(' ');
                rest = &after[end + 1..];
            }
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Drop markdown structural markers, keeping the prose.
fn strip_markdown(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            line.trim_start_matches(['#', '>', '*', '-', ' '])
                .replace("**", "")
                .replace('`', "")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn extract_text(content: &str, format: ContentFormat) -> String {
    match format {
        ContentFormat::Plaintext | ContentFormat::PdfText | ContentFormat::DocxText => {
            content.to_string()
        }
        ContentFormat::Markdown => strip_markdown(content),
        ContentFormat::HtmlText => strip_html(content),
    }
}

/// Keyword dictionary for the insight metrics. Deliberately small; real
/// terminology lives in the knowledge base, this only scores uploads.
const MEDICAL_TERMS: &[&str] = &[
    "patient",
    "diagnosis",
    "treatment",
    "symptoms",
    "medication",
    "cardiac",
    "respiratory",
    "neurological",
    "gastrointestinal",
    "hypertension",
    "diabetes",
    "cancer",
    "infection",
    "surgery",
];

pub fn compute_insights(text: &str) -> ContentInsights {
    let lowered = text.to_lowercase();

    let medical_terms_found: Vec<String> = MEDICAL_TERMS
        .iter()
        .filter(|term| lowered.contains(*term))
        .map(|term| term.to_string())
        .collect();

    let mut key_topics = Vec::new();
    if lowered.contains("cardiac") || lowered.contains("heart") {
        key_topics.push("cardiology".to_string());
    }
    if lowered.contains("respiratory") || lowered.contains("lung") {
        key_topics.push("pulmonology".to_string());
    }
    if lowered.contains("neurological") || lowered.contains("brain") {
        key_topics.push("neurology".to_string());
    }

    let quality_factors = [
        text.len() > 500,
        medical_terms_found.len() > 3,
        !key_topics.is_empty(),
        lowered.contains("conclusion") || lowered.contains("summary"),
    ];
    let content_quality_score =
        quality_factors.iter().filter(|f| **f).count() as f64 / quality_factors.len() as f64;

    ContentInsights {
        word_count: text.split_whitespace().count(),
        character_count: text.len(),
        medical_terms_found,
        key_topics,
        content_quality_score,
    }
}

/// Split text into bounded overlapping segments at word boundaries.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.len() <= chunk_size {
        return vec![trimmed.to_string()];
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < words.len() {
        let mut end = start;
        let mut len = 0usize;
        while end < words.len() {
            let add = words[end].len() + usize::from(len > 0);
            if len + add > chunk_size && end > start {
                break;
            }
            len += add;
            end += 1;
        }
        chunks.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }
        // Step back far enough that the next chunk re-covers roughly
        // `overlap` characters, while always making forward progress.
        let mut carried = 0usize;
        let mut next = end;
        while next > start + 1 && carried < overlap {
            next -= 1;
            carried += words[next].len() + 1;
        }
        start = next;
    }
    chunks
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

pub struct UploadSubmission {
    pub title: String,
    pub content: String,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub source: String,
}

impl UploadSubmission {
    pub fn from_text(title: String, content: String, metadata: UploadMetadata) -> Self {
        Self {
            title,
            content,
            content_type: metadata.content_type.or(Some("plaintext".to_string())),
            filename: None,
            category: metadata.category.unwrap_or_else(|| "general".to_string()),
            tags: metadata.tags,
            source: metadata
                .uploader
                .unwrap_or_else(|| "text_upload".to_string()),
        }
    }
}

/// Converts uploads into chunked, embedded knowledge base entries and
/// tracks each upload's lifecycle in an in-memory registry.
pub struct ContentIngestor {
    knowledge: Arc<dyn KnowledgeStore>,
    records: DashMap<String, UploadedContentRecord>,
    chunking: ChunkingConfig,
}

impl ContentIngestor {
    pub fn new(knowledge: Arc<dyn KnowledgeStore>, chunking: ChunkingConfig) -> Self {
        Self {
            knowledge,
            records: DashMap::new(),
            chunking,
        }
    }

    pub async fn accept(&self, submission: UploadSubmission) -> Result<UploadedContentRecord> {
        let format =
            ContentFormat::resolve(submission.content_type.as_deref(), submission.filename.as_deref())?;

        let record_id = Uuid::new_v4().to_string();
        let mut record = UploadedContentRecord {
            id: record_id.clone(),
            title: submission.title.clone(),
            content: submission.content.clone(),
            category: submission.category.clone(),
            insights: None,
            status: UploadStatus::Pending,
            failure_reason: None,
            document_ids: Vec::new(),
            created_at: Utc::now(),
        };
        self.records.insert(record_id.clone(), record.clone());

        let text = extract_text(&submission.content, format);
        if text.trim().is_empty() {
            record.status = UploadStatus::Failed;
            record.failure_reason = Some("no text content after extraction".to_string());
            self.records.insert(record_id, record.clone());
            return Err(FlowError::Validation(
                "content contains no extractable text".to_string(),
            ));
        }

        let insights = compute_insights(&text);
        let chunks = chunk_text(&text, self.chunking.chunk_size, self.chunking.overlap);
        info!(
            title = %submission.title,
            chunks = chunks.len(),
            terms = insights.medical_terms_found.len(),
            "ingesting upload"
        );

        let mut document_ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let metadata = DocumentMetadata {
                category: submission.category.clone(),
                source: submission.source.clone(),
                tags: submission.tags.clone(),
            };
            match self.knowledge.upsert(chunk, metadata).await {
                Ok(document) => document_ids.push(document.id),
                Err(e) => {
                    warn!(error = %e, "chunk upsert failed");
                    record.status = UploadStatus::Failed;
                    record.failure_reason = Some(e.to_string());
                    record.insights = Some(insights);
                    record.document_ids = document_ids;
                    self.records.insert(record_id, record.clone());
                    return Err(FlowError::Storage(e.to_string()));
                }
            }
        }

        record.status = UploadStatus::Processed;
        record.insights = Some(insights);
        record.document_ids = document_ids;
        self.records.insert(record_id, record.clone());
        Ok(record)
    }

    /// Retry documents whose embedding failed at write time. Returns the
    /// number brought back to full retrievability.
    pub async fn retry_degraded(&self) -> Result<usize> {
        self.knowledge.reembed_degraded().await
    }

    pub fn list(&self) -> Vec<UploadedContentRecord> {
        let mut items: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    pub fn processed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == UploadStatus::Processed)
            .count()
    }

    pub fn terms_learned(&self) -> usize {
        self.records
            .iter()
            .filter_map(|r| r.insights.as_ref().map(|i| i.medical_terms_found.len()))
            .sum()
    }

    pub fn last_processed_at(&self) -> Option<chrono::DateTime<Utc>> {
        self.records
            .iter()
            .filter(|r| r.status == UploadStatus::Processed)
            .map(|r| r.created_at)
            .max()
    }
}
