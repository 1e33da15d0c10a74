use crate::error::RagError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_CHUNK_LENGTH: usize = 50;
pub const COLLECTION_PREFIX: &str = "doc_";

/// Collection name owned by a document. Names are unique per document id.
pub fn collection_name(document_id: &str) -> String {
    format!("{COLLECTION_PREFIX}{document_id}")
}

/// Document ids become directory names, so they are restricted to a path-safe alphabet.
pub fn validate_document_id(document_id: &str) -> Result<(), RagError> {
    let valid = !document_id.is_empty()
        && document_id.len() <= 128
        && document_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');

    if valid {
        Ok(())
    } else {
        Err(RagError::InvalidArgument(format!(
            "document id must be 1-128 chars of [A-Za-z0-9_-], got {document_id:?}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub document_id: String,
    pub source_path: String,
    /// SHA-256 of the source file at build time.
    pub checksum: String,
    pub page_count: usize,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub document_id: String,
    pub page: u32,
    pub sequence: u64,
    pub content_hash: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub page: u32,
    pub preview: String,
}

impl Source {
    pub fn from_chunk(chunk: &Chunk, preview_chars: usize) -> Self {
        let preview = if chunk.text.chars().count() > preview_chars {
            let head: String = chunk.text.chars().take(preview_chars).collect();
            format!("{head}...")
        } else {
            chunk.text.clone()
        };

        Self {
            page: chunk.page,
            preview,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryOutcome {
    pub success: bool,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub chunks_used: usize,
}

impl QueryOutcome {
    pub fn answered(question: &str, answer: String, sources: Vec<Source>) -> Self {
        Self {
            success: true,
            question: question.to_string(),
            answer: Some(answer),
            error: None,
            chunks_used: sources.len(),
            sources,
        }
    }

    pub fn failed(question: &str, error: &RagError) -> Self {
        Self {
            success: false,
            question: question.to_string(),
            answer: None,
            error: Some(error.to_string()),
            sources: Vec::new(),
            chunks_used: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildReport {
    pub success: bool,
    pub document_id: String,
    pub collection_name: String,
    pub total_pages: usize,
    pub total_chunks: usize,
    pub unique_chunks: usize,
    pub dedup_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl BuildReport {
    pub fn failed(document_id: &str, error: &RagError) -> Self {
        Self {
            success: false,
            document_id: document_id.to_string(),
            collection_name: collection_name(document_id),
            total_pages: 0,
            total_chunks: 0,
            unique_chunks: 0,
            dedup_percentage: 0.0,
            message: None,
            error: Some(error.to_string()),
            stage: Some(error.stage().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Absent,
    Building,
    Ready,
    Rebuilding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexStatus {
    pub indexed: bool,
    pub state: IndexState,
    pub collection_name: String,
    pub document_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Length filter only.
    None,
    Exact,
    /// Exact hashing plus a similarity check against the last `window` accepted chunks.
    NearDuplicate { threshold: f64, window: usize },
}

impl Default for DedupStrategy {
    fn default() -> Self {
        DedupStrategy::Exact
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_length: usize,
    pub dedup: DedupStrategy,
    pub mmr_lambda: f32,
    pub fetch_multiplier: usize,
    pub default_k: usize,
    pub success_ttl_secs: u64,
    pub failure_ttl_secs: u64,
    pub embed_batch_size: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub query_timeout_ms: Option<u64>,
    pub preview_chars: usize,
}

impl Default for RagOptions {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 100,
            min_chunk_length: MIN_CHUNK_LENGTH,
            dedup: DedupStrategy::Exact,
            mmr_lambda: 0.7,
            fetch_multiplier: 3,
            default_k: 5,
            success_ttl_secs: 7_200,
            failure_ttl_secs: 300,
            embed_batch_size: 32,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            query_timeout_ms: None,
            preview_chars: 200,
        }
    }
}

impl RagOptions {
    pub fn validate(&self) -> Result<(), RagError> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidArgument("chunk_size must be > 0".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidArgument(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(RagError::InvalidArgument(format!(
                "mmr_lambda {} is outside [0, 1]",
                self.mmr_lambda
            )));
        }
        if self.fetch_multiplier == 0 || self.embed_batch_size == 0 || self.retry_attempts == 0 {
            return Err(RagError::InvalidArgument(
                "fetch_multiplier, embed_batch_size and retry_attempts must be > 0".to_string(),
            ));
        }
        if let DedupStrategy::NearDuplicate { threshold, window } = self.dedup {
            if !(threshold > 0.0 && threshold <= 1.0) || window == 0 {
                return Err(RagError::InvalidArgument(format!(
                    "near-duplicate threshold {threshold} must be in (0, 1] and window {window} > 0"
                )));
            }
        }
        Ok(())
    }
}
