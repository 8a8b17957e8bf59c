//! Completion-service client for judgment calls and content generation.
//!
//! Three call sites share this client: the decision engine's verify band
//! (one-word MERGE/CREATE verdicts), document content generation in the
//! creator, and content folding in the merger. All of them sit behind the
//! [`CompletionBackend`] seam so tests run against in-process fakes.
//!
//! The remote backend follows the same retry discipline as the embedding
//! client: 429/5xx/network errors retry with exponential backoff, other
//! 4xx fail immediately, and every call passes the rate limiter first.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::limiter::RateLimiter;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// One remote completion call.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Rate-limited completion client.
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    limiter: RateLimiter,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, min_interval_ms: u64) -> Self {
        Self {
            backend,
            limiter: RateLimiter::from_millis(min_interval_ms),
        }
    }

    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        let backend: Arc<dyn CompletionBackend> = match config.provider.as_str() {
            "openai" => Arc::new(OpenAIChatBackend::new(config)?),
            other => bail!("Unknown completion provider: {}", other),
        };
        Ok(Self::new(backend, config.min_interval_ms))
    }

    /// Free-form generation (document content, merge folding).
    pub async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        self.limiter.wait().await;
        let text = self.backend.complete(system, prompt).await?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            bail!("Completion service returned empty content");
        }
        Ok(trimmed.to_string())
    }

    /// Constrained one-word verdict for the verify band.
    ///
    /// Returns the parsed verdict; an unparseable response is an error so
    /// the caller can apply its fail-safe.
    pub async fn verdict(&self, system: &str, prompt: &str) -> Result<Verdict> {
        self.limiter.wait().await;
        let text = self.backend.complete(system, prompt).await?;
        parse_verdict(&text)
            .ok_or_else(|| anyhow::anyhow!("Unparseable verdict from completion service: {:?}", text))
    }
}

/// Outcome of a verify-band judgment call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Merge,
    Create,
}

/// Extract a MERGE/CREATE verdict from a completion response.
///
/// Lenient on decoration (case, punctuation, surrounding prose on the same
/// line) but only trusts the first line, and rejects responses naming both
/// actions.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let first_line = text.trim().lines().next()?.to_uppercase();
    let merge = first_line.contains("MERGE");
    let create = first_line.contains("CREATE");
    match (merge, create) {
        (true, false) => Some(Verdict::Merge),
        (false, true) => Some(Verdict::Create),
        _ => None,
    }
}

// ============ OpenAI Chat Backend ============

/// Chat-completions backend for the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIChatBackend {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatBackend {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAIChatBackend {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
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
                        return extract_message_content(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Completions API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Completions API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
    }
}

fn extract_message_content(json: &Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message.content"))
}
