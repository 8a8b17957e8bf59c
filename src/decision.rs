//! Similarity-based three-tier ingestion classifier.
//!
//! For each incoming topic the engine compares the topic's embedding
//! against the **stored** chunk embeddings of every existing document
//! (loaded as-is from the store, never recomputed, so the comparison is
//! against what is actually indexed) and takes the best cosine score:
//!
//! - at or above `merge_threshold` → MERGE into the best document,
//!   no completion call
//! - at or below `create_threshold` → CREATE, no completion call
//! - in between (the verify band) → one bounded completion-service call
//!   whose one-word verdict settles the decision
//!
//! Deterministic thresholds resolve most topics by pure vector comparison;
//! the expensive judgment call is reserved for the genuinely ambiguous
//! middle band. A failed verification always falls back to CREATE — an
//! incorrect merge corrupts another document's content, an unnecessary
//! create is merely redundant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::completion::{CompletionClient, Verdict};
use crate::config::DecisionConfig;
use crate::embedding::cosine_similarity;
use crate::models::{Confidence, Decision, DecisionAction, StoredDocument, Topic};

/// Character budget per side of the verify prompt.
const EXCERPT_CHARS: usize = 300;

const VERIFY_SYSTEM_PROMPT: &str = "You judge whether a new topic fragment covers the same \
subject as an existing document. Respond with exactly one word: MERGE if the topic belongs \
inside the existing document, CREATE if it deserves a document of its own.";

pub struct DecisionEngine {
    config: DecisionConfig,
    completion: Arc<CompletionClient>,
    verify_calls: AtomicUsize,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, completion: Arc<CompletionClient>) -> Self {
        Self {
            config,
            completion,
            verify_calls: AtomicUsize::new(0),
        }
    }

    /// Number of verify-band completion calls issued so far.
    pub fn verify_call_count(&self) -> usize {
        self.verify_calls.load(Ordering::Relaxed)
    }

    /// Classify one topic against the existing corpus.
    ///
    /// Never fails: completion-service errors resolve to a low-confidence
    /// CREATE with the error recorded in `reason`.
    pub async fn decide(
        &self,
        topic: &Topic,
        topic_embedding: &[f32],
        corpus: &[StoredDocument],
    ) -> Decision {
        let Some((best, similarity)) = best_match(topic_embedding, corpus) else {
            return Decision {
                action: DecisionAction::Create,
                similarity: 0.0,
                target_document_id: None,
                reason: "no existing documents".to_string(),
                confidence: Confidence::High,
                llm_used: false,
            };
        };

        debug!(
            topic = %topic.title,
            best_doc = %best.document.id,
            similarity,
            "best corpus match"
        );

        if similarity >= self.config.merge_threshold {
            return Decision {
                action: DecisionAction::Merge,
                similarity,
                target_document_id: Some(best.document.id.clone()),
                reason: format!(
                    "similarity {:.3} at or above merge threshold {:.2}",
                    similarity, self.config.merge_threshold
                ),
                confidence: Confidence::High,
                llm_used: false,
            };
        }

        if similarity <= self.config.create_threshold {
            return Decision {
                action: DecisionAction::Create,
                similarity,
                target_document_id: None,
                reason: format!(
                    "similarity {:.3} at or below create threshold {:.2}",
                    similarity, self.config.create_threshold
                ),
                confidence: Confidence::High,
                llm_used: false,
            };
        }

        self.verify(topic, best, similarity).await
    }

    /// Verify-band resolution via the completion service.
    async fn verify(&self, topic: &Topic, best: &StoredDocument, similarity: f32) -> Decision {
        self.verify_calls.fetch_add(1, Ordering::Relaxed);

        let prompt = build_verify_prompt(topic, best, similarity);
        match self.completion.verdict(VERIFY_SYSTEM_PROMPT, &prompt).await {
            Ok(Verdict::Merge) => Decision {
                action: DecisionAction::Merge,
                similarity,
                target_document_id: Some(best.document.id.clone()),
                reason: format!("verified merge at similarity {:.3}", similarity),
                confidence: Confidence::Medium,
                llm_used: true,
            },
            Ok(Verdict::Create) => Decision {
                action: DecisionAction::Create,
                similarity,
                target_document_id: None,
                reason: format!("verified create at similarity {:.3}", similarity),
                confidence: Confidence::Medium,
                llm_used: true,
            },
            Err(e) => {
                warn!(
                    topic = %topic.title,
                    error = %e,
                    "verification failed, defaulting to create"
                );
                Decision {
                    action: DecisionAction::Create,
                    similarity,
                    target_document_id: None,
                    reason: format!(
                        "verification failed ({}), defaulting to create at similarity {:.3}",
                        e, similarity
                    ),
                    confidence: Confidence::Low,
                    llm_used: false,
                }
            }
        }
    }
}

/// Best-scoring document for a topic embedding, with its score.
///
/// A document's score is the max cosine over its stored chunk vectors: one
/// strongly matching section is the merge signal, and a mean would dilute
/// long documents.
fn best_match<'a>(
    topic_embedding: &[f32],
    corpus: &'a [StoredDocument],
) -> Option<(&'a StoredDocument, f32)> {
    corpus
        .iter()
        .map(|stored| (stored, document_similarity(topic_embedding, stored)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

fn document_similarity(topic_embedding: &[f32], stored: &StoredDocument) -> f32 {
    stored
        .embeddings
        .iter()
        .map(|e| cosine_similarity(topic_embedding, e))
        .fold(0.0f32, f32::max)
}

fn build_verify_prompt(topic: &Topic, best: &StoredDocument, similarity: f32) -> String {
    let doc = &best.document;
    let doc_excerpt = if doc.summary.is_empty() {
        truncate_chars(&doc.content, EXCERPT_CHARS)
    } else {
        truncate_chars(&doc.summary, EXCERPT_CHARS)
    };

    format!(
        "New topic: {}\n{}\n\nExisting document: {}\n{}\n\nEmbedding similarity: {:.3}\n\n\
         Answer MERGE or CREATE.",
        truncate_chars(&topic.title, EXCERPT_CHARS),
        truncate_chars(&topic.content, EXCERPT_CHARS),
        truncate_chars(&doc.title, EXCERPT_CHARS),
        doc_excerpt,
        similarity
    )
}

/// First `max_chars` characters of a string, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
