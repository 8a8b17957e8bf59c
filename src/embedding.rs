//! Embedding client: batching, response normalization, and fallback.
//!
//! The [`EmbeddingClient`] wraps an [`EmbeddingBackend`] (one remote call
//! per batch) and layers on the behavior the ingestion pipeline depends on:
//!
//! - **Batch partitioning** — `embed_many` slices its input into
//!   provider-capacity batches and issues one remote call per batch, the
//!   primary cost lever of the whole pipeline.
//! - **Shape normalization** — batch responses arrive in several shapes
//!   (wrapper-object lists, bare vector lists, singly- or doubly-nested
//!   arrays); [`parse_batch_response`] resolves all of them to a flat
//!   `Vec<Vec<f32>>` and treats anything unrecognized as a hard error.
//! - **Length/dims assertions** — a batch that returns the wrong number of
//!   vectors, or vectors of the wrong width, is a defect, never propagated
//!   as data.
//! - **Per-item fallback** — a failed batch degrades to sequential
//!   single-text calls for that batch only.
//! - **Rate limiting** — every remote call waits on a shared
//!   [`RateLimiter`] first.
//!
//! Also provides the vector utilities used by the store and the decision
//! engine: [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].
//!
//! # Retry Strategy (OpenAI backend)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::limiter::RateLimiter;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// One remote embedding call per batch of texts.
///
/// Implementations return exactly one vector per input text, in input
/// order. Batching, normalization-failure fallback, and rate limiting live
/// in [`EmbeddingClient`], not here.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed one batch of texts with a single remote call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Batch-aware embedding client used by the ingestion pipeline.
pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    limiter: RateLimiter,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, batch_size: usize, min_interval_ms: u64) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            limiter: RateLimiter::from_millis(min_interval_ms),
        }
    }

    /// Build a client from configuration. Currently `"openai"` is the only
    /// remote provider.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let backend: Arc<dyn EmbeddingBackend> = match config.provider.as_str() {
            "openai" => Arc::new(OpenAIBackend::new(config)?),
            other => bail!("Unknown embedding provider: {}", other),
        };
        Ok(Self::new(backend, config.batch_size, config.min_interval_ms))
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    /// Embed a list of texts, one vector per text, order-preserving.
    ///
    /// Issues one remote call per `batch_size` slice. A batch whose call or
    /// validation fails falls back to per-text calls for that batch only,
    /// so a single bad batch degrades instead of aborting the run.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let dims = self.backend.dims();
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            self.limiter.wait().await;

            let batch_result = match self.backend.embed_batch(batch).await {
                Ok(vectors) => validate_vectors(vectors, batch.len(), dims),
                Err(e) => Err(e),
            };

            match batch_result {
                Ok(mut vectors) => out.append(&mut vectors),
                Err(e) => {
                    warn!(
                        batch_len = batch.len(),
                        error = %e,
                        "embedding batch failed, falling back to per-text calls"
                    );
                    for text in batch {
                        self.limiter.wait().await;
                        let vectors = self
                            .backend
                            .embed_batch(std::slice::from_ref(text))
                            .await?;
                        let mut vectors = validate_vectors(vectors, 1, dims)?;
                        out.append(&mut vectors);
                    }
                }
            }
        }

        if out.len() != texts.len() {
            bail!(
                "Embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                out.len()
            );
        }

        Ok(out)
    }

    /// Attach embeddings to a chunk set, in one batch pass.
    ///
    /// If the batch pass fails outright, salvages chunk by chunk: chunks
    /// whose individual embedding also fails are excluded with a warning
    /// and the survivors re-indexed contiguously, so no chunk ever leaves
    /// here without a vector. Errors only when nothing survives.
    pub async fn embed_chunks(&self, chunks: Vec<crate::models::Chunk>) -> Result<Vec<crate::models::Chunk>> {
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        match self.embed_many(&texts).await {
            Ok(vectors) => {
                let mut chunks = chunks;
                for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                    chunk.embedding = Some(vector);
                }
                Ok(chunks)
            }
            Err(batch_err) => {
                warn!(
                    error = %batch_err,
                    "chunk batch embedding failed, salvaging chunk by chunk"
                );
                let total = chunks.len();
                let mut survivors = Vec::with_capacity(total);
                for mut chunk in chunks {
                    match self.embed_one(&chunk.content).await {
                        Ok(vector) => {
                            chunk.embedding = Some(vector);
                            survivors.push(chunk);
                        }
                        Err(e) => {
                            warn!(
                                chunk_id = %chunk.id,
                                error = %e,
                                "excluding chunk that could not be embedded"
                            );
                        }
                    }
                }

                if survivors.is_empty() {
                    bail!("No chunks could be embedded: {:#}", batch_err);
                }
                if survivors.len() < total {
                    warn!(
                        kept = survivors.len(),
                        dropped = total - survivors.len(),
                        "persisting partial chunk set after embedding failures"
                    );
                    for (i, chunk) in survivors.iter_mut().enumerate() {
                        chunk.chunk_index = i as i64;
                    }
                }
                Ok(survivors)
            }
        }
    }
}

/// Assert one non-empty vector per input, of the expected width.
fn validate_vectors(
    vectors: Vec<Vec<f32>>,
    expected_len: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected_len {
        bail!(
            "Embedding count mismatch: {} inputs, {} vectors",
            expected_len,
            vectors.len()
        );
    }
    for (i, vector) in vectors.iter().enumerate() {
        if vector.is_empty() {
            bail!("Embedding {} is empty", i);
        }
        if dims > 0 && vector.len() != dims {
            bail!(
                "Embedding {} has {} dims, expected {}",
                i,
                vector.len(),
                dims
            );
        }
    }
    Ok(vectors)
}

// ============ OpenAI Backend ============

/// Embedding backend for the OpenAI embeddings API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIBackend {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_EMBEDDINGS_URL.to_string()),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return parse_batch_response(&json, texts.len());
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Embeddings API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embeddings API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

// ============ Response Normalization ============

/// Normalize a batch embedding response to a flat list of flat vectors.
///
/// Accepted shapes, resolved explicitly rather than guessed:
/// - object with a `data` (or `embeddings`) array, where each element is a
///   wrapper object carrying an `embedding` field
/// - bare array of flat float vectors
/// - bare flat float array (single-input responses)
/// - a doubly-nested array (`[[v1, v2, ...]]`) wrapping the vector list
///
/// Anything else, and any result whose length does not equal `expected`,
/// is a hard error. A wrongly-flattened response that silently drops
/// vectors must never leave this function.
pub fn parse_batch_response(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let vectors = normalize_value(json)?;
    if vectors.len() != expected {
        bail!(
            "Embedding response length mismatch: expected {}, got {}",
            expected,
            vectors.len()
        );
    }
    Ok(vectors)
}

fn normalize_value(value: &Value) -> Result<Vec<Vec<f32>>> {
    match value {
        Value::Object(map) => {
            let inner = map
                .get("data")
                .or_else(|| map.get("embeddings"))
                .ok_or_else(|| {
                    anyhow::anyhow!("Invalid embedding response: no data/embeddings field")
                })?;
            normalize_value(inner)
        }
        Value::Array(items) => normalize_array(items),
        _ => bail!("Invalid embedding response: expected object or array"),
    }
}

fn normalize_array(items: &[Value]) -> Result<Vec<Vec<f32>>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    match &items[0] {
        // Wrapper objects: [{"embedding": [...]}, ...]
        Value::Object(_) => items
            .iter()
            .map(|item| {
                let emb = item.get("embedding").ok_or_else(|| {
                    anyhow::anyhow!("Invalid embedding response: wrapper missing embedding field")
                })?;
                parse_flat_vector(emb)
            })
            .collect(),

        // Flat float array: a single vector
        Value::Number(_) => Ok(vec![numbers_to_vector(items)?]),

        // Array elements: either a list of vectors, or one more level of
        // nesting around the vector list
        Value::Array(first_inner) => {
            let inner_is_numeric = first_inner
                .first()
                .map(|v| v.is_number())
                .unwrap_or(false);
            if inner_is_numeric {
                items.iter().map(parse_flat_vector).collect()
            } else if items.len() == 1 {
                // Doubly nested: [[[..], [..]]] — unwrap one level
                normalize_array(first_inner)
            } else {
                bail!("Invalid embedding response: unrecognized nested array shape")
            }
        }

        _ => bail!("Invalid embedding response: unrecognized array element"),
    }
}

fn parse_flat_vector(value: &Value) -> Result<Vec<f32>> {
    match value {
        Value::Array(items) => {
            if items.len() == 1 && items[0].is_array() {
                // Singly-nested vector: [[...]]
                return parse_flat_vector(&items[0]);
            }
            numbers_to_vector(items)
        }
        _ => bail!("Invalid embedding response: vector is not an array"),
    }
}

fn numbers_to_vector(items: &[Value]) -> Result<Vec<f32>> {
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: non-numeric element"))
        })
        .collect()
}

// ============ Vector Utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing a
/// BLOB of `vec.len() × 4` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
