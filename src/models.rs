//! Core data models used throughout topic-curator.
//!
//! These types represent the topics, documents, chunks, and decisions that
//! flow through the ingestion pipeline, plus the per-batch report returned
//! to callers.

use serde::{Deserialize, Serialize};

/// Content fragment extracted from crawled pages, awaiting a storage decision.
///
/// Produced by an external extraction step and consumed once per ingestion
/// pass. Topics have no lifecycle of their own beyond that pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
}

impl Topic {
    /// Text used when embedding a topic for similarity comparison.
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }
}

/// Durable unit of retrievable knowledge stored in SQLite.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub category: String,
    /// Presentation variant tag (e.g. "expanded", "summary").
    pub mode: String,
    pub content: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Ordered log of topics folded into this document.
    pub merge_history: Vec<MergeRecord>,
}

/// One entry in a document's merge history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    pub topic_title: String,
    #[serde(default)]
    pub source_urls: Vec<String>,
    pub merged_at: i64,
}

/// A bounded slice of a document's content.
///
/// Chunks are owned exclusively by their document: they are deleted and
/// regenerated wholesale whenever the document's content changes, never
/// patched in place. The `embedding` is `None` only between chunking and
/// the embedding pass; the store rejects chunks without one.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub embedding: Option<Vec<f32>>,
}

/// Classification outcome for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Create,
    Merge,
}

/// Confidence attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Output of the decision engine for one topic.
///
/// Ephemeral: logged and consumed within the ingestion run, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action: DecisionAction,
    /// Best cosine similarity against the existing corpus, in [0, 1].
    pub similarity: f32,
    /// Present iff `action` is [`DecisionAction::Merge`].
    pub target_document_id: Option<String>,
    pub reason: String,
    pub confidence: Confidence,
    /// True when the verify band consulted the completion service.
    pub llm_used: bool,
}

/// A document paired with the chunk embeddings actually stored for it.
///
/// Produced by the store for the decision engine; the vectors are decoded
/// from the persisted blobs, never recomputed from live content.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub document: Document,
    pub embeddings: Vec<Vec<f32>>,
}

/// One-line listing entry for CLI output.
#[derive(Debug, Clone)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub category: String,
    pub chunk_count: i64,
    pub updated_at: i64,
}

/// Stage at which a topic failed during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Embedding,
    Generation,
    Fold,
    Store,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Embedding => "embedding",
            FailureStage::Generation => "generation",
            FailureStage::Fold => "fold",
            FailureStage::Store => "store",
        };
        f.write_str(s)
    }
}

/// A topic that could not be materialized, with the stage and reason.
#[derive(Debug, Clone)]
pub struct TopicFailure {
    pub topic_title: String,
    pub stage: FailureStage,
    pub reason: String,
}

/// Error tagged with the pipeline stage it occurred in.
///
/// Creator and merger surface these so the batch report can say where each
/// topic was lost.
#[derive(Debug)]
pub struct StageError {
    pub stage: FailureStage,
    pub reason: String,
}

impl StageError {
    pub fn new(stage: FailureStage, error: impl std::fmt::Display) -> Self {
        Self {
            stage,
            reason: error.to_string(),
        }
    }

    pub fn into_failure(self, topic_title: &str) -> TopicFailure {
        TopicFailure {
            topic_title: topic_title.to_string(),
            stage: self.stage,
            reason: self.reason,
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.reason)
    }
}

/// Per-batch ingestion outcome.
///
/// Failures are collected here rather than raised, so one bad topic never
/// loses the progress of the rest of the batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub topics_seen: usize,
    /// Classification per topic, in input order (title, decision).
    pub decisions: Vec<(String, Decision)>,
    /// New document ids, one per created topic.
    pub created: Vec<String>,
    /// Target document ids, one entry per successfully folded topic;
    /// repeats when several topics fold into the same document.
    pub merged: Vec<String>,
    pub failed: Vec<TopicFailure>,
    /// Number of verify-band completion-service calls issued.
    pub llm_verifications: usize,
    /// True when a cooperative cancellation stopped the batch early.
    pub cancelled: bool,
}

impl IngestReport {
    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn merged_count(&self) -> usize {
        self.merged.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}
