//! Document creation: CREATE-resolved topics become new stored documents.
//!
//! Per topic: generate document content via the completion service, assign
//! a collision-resistant identity, chunk, embed all chunks in one batch
//! call, and persist transactionally. Generation failures degrade to the
//! topic's own content rather than dropping the topic; embedding and store
//! failures fail that topic alone.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::build_chunks;
use crate::completion::CompletionClient;
use crate::config::{ChunkingConfig, GenerationConfig};
use crate::embedding::EmbeddingClient;
use crate::models::{Document, FailureStage, StageError, Topic, TopicFailure};
use crate::store::DocumentStore;

const GENERATION_SYSTEM_PROMPT: &str = "You are a technical writer maintaining a knowledge \
base built from crawled source material. Write well-structured document text in plain \
prose paragraphs. Respond with the document body only, no preamble.";

#[derive(Clone)]
pub struct DocumentCreator {
    store: DocumentStore,
    embedding: Arc<EmbeddingClient>,
    completion: Arc<CompletionClient>,
    chunking: ChunkingConfig,
    generation: GenerationConfig,
}

impl DocumentCreator {
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

    /// Materialize a batch of CREATE-resolved topics, one document each.
    ///
    /// Per-topic failures are collected, never raised; the batch always
    /// runs to completion.
    pub async fn create(&self, topics: &[Topic]) -> (Vec<Document>, Vec<TopicFailure>) {
        let mut documents = Vec::new();
        let mut failures = Vec::new();

        for topic in topics {
            match self.create_one(topic).await {
                Ok(document) => documents.push(document),
                Err(e) => failures.push(e.into_failure(&topic.title)),
            }
        }

        (documents, failures)
    }

    /// Turn one topic into a persisted document.
    pub async fn create_one(&self, topic: &Topic) -> std::result::Result<Document, StageError> {
        let content = self.generate_content(topic).await?;

        let now = Utc::now();
        let id = generate_document_id(&topic.title, now.timestamp_millis());

        // An id hit means a re-run of the same item; keep its birth time
        let created_at = match self.store.get(&id).await {
            Ok(Some(existing)) => existing.created_at,
            Ok(None) => now.timestamp(),
            Err(e) => {
                return Err(StageError::new(FailureStage::Store, format!("{:#}", e)));
            }
        };

        let document = Document {
            summary: summary_excerpt(&content, self.generation.summary_chars),
            id: id.clone(),
            title: topic.title.clone(),
            category: topic.category.clone(),
            mode: self.generation.mode.clone(),
            content,
            keywords: topic.keywords.clone(),
            created_at,
            updated_at: now.timestamp(),
            merge_history: Vec::new(),
        };

        let chunks = build_chunks(&id, &document.content, &self.chunking);
        if chunks.is_empty() {
            return Err(StageError::new(
                FailureStage::Generation,
                "document content produced no chunks",
            ));
        }

        let chunks = self
            .embedding
            .embed_chunks(chunks)
            .await
            .map_err(|e| StageError::new(FailureStage::Embedding, format!("{:#}", e)))?;

        self.store
            .upsert(&document, &chunks)
            .await
            .map_err(|e| StageError::new(FailureStage::Store, format!("{:#}", e)))?;

        info!(
            document_id = %document.id,
            chunks = chunks.len(),
            "created document"
        );

        Ok(document)
    }

    /// Expand a topic into document content, falling back to the topic's
    /// own text when the completion service is unavailable.
    async fn generate_content(&self, topic: &Topic) -> std::result::Result<String, StageError> {
        let prompt = build_generation_prompt(topic, &self.generation.mode);

        match self.completion.generate(GENERATION_SYSTEM_PROMPT, &prompt).await {
            Ok(content) => Ok(content),
            Err(e) => {
                let fallback = topic.content.trim();
                if fallback.is_empty() {
                    return Err(StageError::new(FailureStage::Generation, format!("{:#}", e)));
                }
                warn!(
                    topic = %topic.title,
                    error = %e,
                    "content generation failed, storing topic content verbatim"
                );
                Ok(fallback.to_string())
            }
        }
    }
}

fn build_generation_prompt(topic: &Topic, mode: &str) -> String {
    let keywords = if topic.keywords.is_empty() {
        String::new()
    } else {
        format!("\nKeywords: {}", topic.keywords.join(", "))
    };

    format!(
        "Write the {} document for this topic.\n\nTitle: {}\nCategory: {}{}\n\nSource material:\n{}",
        mode, topic.title, topic.category, keywords, topic.content
    )
}

/// Collision-resistant document identity.
///
/// Slugified title for readability, epoch milliseconds plus a random
/// suffix for uniqueness — two topics with the same title in the same run
/// (or on the same day) must never collide.
pub fn generate_document_id(title: &str, now_millis: i64) -> String {
    let slug = slugify(title);
    let uniq = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", slug, now_millis, &uniq[..8])
}

fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut prev_dash = true;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            slug.push('-');
            prev_dash = true;
        }
        if slug.len() >= 60 {
            break;
        }
    }

    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "topic".to_string()
    } else {
        slug
    }
}

/// Leading excerpt of content used as the document summary.
pub(crate) fn summary_excerpt(content: &str, max_chars: usize) -> String {
    let first_para = content
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("");

    if first_para.chars().count() <= max_chars {
        return first_para.to_string();
    }
    first_para.chars().take(max_chars).collect()
}
