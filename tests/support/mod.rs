//! Shared fixtures for integration tests: deterministic in-process
//! embedding/completion backends and store helpers. Nothing here touches
//! the network.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

use topic_curator::chunk::build_chunks;
use topic_curator::completion::CompletionBackend;
use topic_curator::config::{
    ChunkingConfig, CompletionConfig, Config, DbConfig, DecisionConfig, EmbeddingConfig,
    GenerationConfig, IngestConfig,
};
use topic_curator::db;
use topic_curator::embedding::EmbeddingBackend;
use topic_curator::migrate;
use topic_curator::models::{Document, Topic};
use topic_curator::store::DocumentStore;

pub const DIMS: usize = 8;

/// Map a text to a deterministic unit vector by keyword.
///
/// Texts mentioning the same subject land on the same axis (cosine 1.0),
/// different subjects are orthogonal (cosine 0.0), and "hybrid" texts sit
/// at cosine 0.75 against the "alpha" axis — inside the default verify
/// band.
pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32; DIMS];
    if lower.contains("hybrid") {
        v[0] = 0.75;
        v[1] = (1.0f32 - 0.75 * 0.75).sqrt();
    } else if lower.contains("alpha") {
        v[0] = 1.0;
    } else if lower.contains("beta") {
        v[1] = 1.0;
    } else if lower.contains("gamma") {
        v[2] = 1.0;
    } else {
        v[3] = 1.0;
    }
    v
}

/// Deterministic embedding backend recording every call's batch size.
pub struct KeywordEmbedder {
    calls: Mutex<Vec<usize>>,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl EmbeddingBackend for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-mock"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.lock().unwrap().push(texts.len());
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

/// Scripted completion backend.
///
/// Distinguishes call sites by system prompt: verdict calls reply with the
/// scripted verdict, generation calls echo the source material back, fold
/// calls concatenate existing content with the new material. Setting
/// `fail_content_calls` makes generation and fold calls error while
/// verdicts keep working.
pub struct ScriptedCompletion {
    pub verdict: Option<String>,
    pub fail_content_calls: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            verdict: None,
            fail_content_calls: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_verdict(verdict: &str) -> Self {
        Self {
            verdict: Some(verdict.to_string()),
            fail_content_calls: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_content() -> Self {
        Self {
            verdict: None,
            fail_content_calls: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn verdict_call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.contains("exactly one word"))
            .count()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedCompletion {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        self.calls.lock().unwrap().push(system.to_string());

        if system.contains("exactly one word") {
            return match &self.verdict {
                Some(verdict) => Ok(verdict.clone()),
                None => bail!("verification service unavailable"),
            };
        }

        if self.fail_content_calls {
            bail!("completion service unavailable");
        }

        if system.contains("Fold the new material") {
            let (existing, new) = prompt
                .split_once("\n\nNew material: ")
                .unwrap_or((prompt, ""));
            let existing_content = existing.split_once("\n\n").map(|(_, c)| c).unwrap_or(existing);
            let new_content = new.split_once("\n\n").map(|(_, c)| c).unwrap_or(new);
            return Ok(format!("{}\n\n{}", existing_content, new_content));
        }

        // Content generation: echo the source material
        let content = prompt
            .split_once("Source material:\n")
            .map(|(_, c)| c)
            .unwrap_or(prompt);
        Ok(content.to_string())
    }
}

pub fn test_config() -> Config {
    Config {
        db: DbConfig {
            path: PathBuf::from(":memory:"),
        },
        chunking: ChunkingConfig {
            target_tokens: 100,
            overlap_tokens: 10,
        },
        decision: DecisionConfig {
            merge_threshold: 0.85,
            create_threshold: 0.65,
        },
        embedding: EmbeddingConfig::default(),
        completion: CompletionConfig::default(),
        generation: GenerationConfig::default(),
        ingest: IngestConfig { concurrency: 4 },
    }
}

pub async fn memory_store() -> DocumentStore {
    let pool = db::connect_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    DocumentStore::new(pool, "keyword-mock", DIMS)
}

pub fn topic(title: &str, content: &str) -> Topic {
    Topic {
        title: title.to_string(),
        content: content.to_string(),
        category: "test".to_string(),
        keywords: vec![],
        source_urls: vec![],
    }
}

/// Insert a document whose chunks carry keyword vectors, bypassing the
/// pipeline. Useful for seeding a corpus before exercising one stage.
pub async fn seed_document(store: &DocumentStore, id: &str, title: &str, content: &str) -> Document {
    let document = Document {
        id: id.to_string(),
        title: title.to_string(),
        category: "test".to_string(),
        mode: "expanded".to_string(),
        content: content.to_string(),
        summary: content.to_string(),
        keywords: vec![],
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
        merge_history: vec![],
    };

    let chunking = ChunkingConfig {
        target_tokens: 100,
        overlap_tokens: 10,
    };
    let mut chunks = build_chunks(id, content, &chunking);
    for chunk in &mut chunks {
        chunk.embedding = Some(keyword_vector(&chunk.content));
    }

    store.upsert(&document, &chunks).await.unwrap();
    document
}
