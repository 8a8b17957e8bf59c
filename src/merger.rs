//! Document merging: MERGE-resolved topics fold into their target document.
//!
//! Topics routed to the same document within one batch are folded
//! sequentially into an accumulating in-memory content state; chunking and
//! embedding happen once per document, after the last fold. Re-chunking
//! after every topic would multiply embedding cost by the group size for
//! no benefit. The chunk set is replaced wholesale in the store's upsert
//! transaction, under the same document id.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chunk::build_chunks;
use crate::completion::CompletionClient;
use crate::config::{ChunkingConfig, GenerationConfig};
use crate::creator::summary_excerpt;
use crate::embedding::EmbeddingClient;
use crate::models::{Document, FailureStage, MergeRecord, Topic, TopicFailure};
use crate::store::DocumentStore;

const FOLD_SYSTEM_PROMPT: &str = "You maintain documents in a knowledge base. Fold the new \
material into the existing document: integrate it where it belongs, resolve conflicts in \
favor of the newer material, and keep everything else. Respond with the complete updated \
document text only, no preamble.";

#[derive(Clone)]
pub struct DocumentMerger {
    store: DocumentStore,
    embedding: Arc<EmbeddingClient>,
    completion: Arc<CompletionClient>,
    chunking: ChunkingConfig,
    generation: GenerationConfig,
}

impl DocumentMerger {
    pub fn new(
        store: DocumentStore,
        embedding: Arc<EmbeddingClient>,
        completion: Arc<CompletionClient>,
        chunking: ChunkingConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            store,
            embedding,
            completion,
            chunking,
            generation,
        }
    }

    /// Merge every group sequentially. Groups with distinct targets can
    /// also run in parallel via [`DocumentMerger::merge_group`]; this
    /// wrapper exists for callers without their own worker pool.
    pub async fn merge(
        &self,
        groups: Vec<(Document, Vec<Topic>)>,
    ) -> (Vec<Document>, Vec<TopicFailure>) {
        let mut documents = Vec::new();
        let mut failures = Vec::new();

        for (target, topics) in groups {
            let (updated, mut group_failures) = self.merge_group(target, &topics).await;
            if let Some(document) = updated {
                documents.push(document);
            }
            failures.append(&mut group_failures);
        }

        (documents, failures)
    }

    /// Fold a group of topics into one target document and persist the
    /// result.
    ///
    /// Returns the updated document (None if nothing was folded or the
    /// write failed) plus the per-topic failures. The document id is
    /// preserved exactly; only content, summary, keywords, updated_at,
    /// merge_history, and the chunk set change.
    pub async fn merge_group(
        &self,
        target: Document,
        topics: &[Topic],
    ) -> (Option<Document>, Vec<TopicFailure>) {
        let mut document = target;
        let mut failures: Vec<TopicFailure> = Vec::new();
        let mut folded: Vec<&Topic> = Vec::new();

        for topic in topics {
            let prompt = build_fold_prompt(&document, topic);
            match self.completion.generate(FOLD_SYSTEM_PROMPT, &prompt).await {
                Ok(new_content) => {
                    document.content = new_content;
                    document.merge_history.push(MergeRecord {
                        topic_title: topic.title.clone(),
                        source_urls: topic.source_urls.clone(),
                        merged_at: Utc::now().timestamp(),
                    });
                    merge_keywords(&mut document.keywords, &topic.keywords);
                    folded.push(topic);
                }
                Err(e) => {
                    warn!(
                        topic = %topic.title,
                        document_id = %document.id,
                        error = %e,
                        "fold failed, topic skipped"
                    );
                    failures.push(TopicFailure {
                        topic_title: topic.title.clone(),
                        stage: FailureStage::Fold,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        if folded.is_empty() {
            // Nothing folded; leave the stored document untouched
            return (None, failures);
        }

        document.summary = summary_excerpt(&document.content, self.generation.summary_chars);
        document.updated_at = Utc::now().timestamp();

        // One chunking + embedding pass for the whole group
        let chunks = build_chunks(&document.id, &document.content, &self.chunking);
        let chunks = match self.embedding.embed_chunks(chunks).await {
            Ok(chunks) if !chunks.is_empty() => chunks,
            Ok(_) => {
                fail_folded(&mut failures, &folded, "updated content produced no chunks");
                return (None, failures);
            }
            Err(e) => {
                fail_folded(&mut failures, &folded, &format!("{:#}", e));
                return (None, failures);
            }
        };

        if let Err(e) = self.store.upsert(&document, &chunks).await {
            fail_folded(&mut failures, &folded, &format!("{:#}", e));
            return (None, failures);
        }

        info!(
            document_id = %document.id,
            folded = folded.len(),
            chunks = chunks.len(),
            "merged topics into document"
        );

        (Some(document), failures)
    }
}

fn fail_folded(failures: &mut Vec<TopicFailure>, folded: &[&Topic], reason: &str) {
    for topic in folded {
        failures.push(TopicFailure {
            topic_title: topic.title.clone(),
            stage: FailureStage::Store,
            reason: reason.to_string(),
        });
    }
}

fn build_fold_prompt(document: &Document, topic: &Topic) -> String {
    format!(
        "Existing document: {}\n\n{}\n\nNew material: {}\n\n{}",
        document.title, document.content, topic.title, topic.content
    )
}

/// Union the topic's keywords into the document's, preserving order.
fn merge_keywords(existing: &mut Vec<String>, incoming: &[String]) {
    for keyword in incoming {
        if !existing.iter().any(|k| k.eq_ignore_ascii_case(keyword)) {
            existing.push(keyword.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keywords_dedupes_case_insensitively() {
        let mut existing = vec!["rust".to_string(), "memory".to_string()];
        merge_keywords(
            &mut existing,
            &["Rust".to_string(), "borrowing".to_string()],
        );
        assert_eq!(existing, vec!["rust", "memory", "borrowing"]);
    }

    #[test]
    fn test_fold_prompt_contains_both_sides() {
        let document = Document {
            id: "d".to_string(),
            title: "Doc title".to_string(),
            category: String::new(),
            mode: "expanded".to_string(),
            content: "Existing body.".to_string(),
            summary: String::new(),
            keywords: vec![],
            created_at: 0,
            updated_at: 0,
            merge_history: vec![],
        };
        let topic = Topic {
            title: "New angle".to_string(),
            content: "Fresh facts.".to_string(),
            category: String::new(),
            keywords: vec![],
            source_urls: vec![],
        };
        let prompt = build_fold_prompt(&document, &topic);
        assert!(prompt.contains("Existing body."));
        assert!(prompt.contains("Fresh facts."));
        assert!(prompt.contains("New angle"));
    }
}
