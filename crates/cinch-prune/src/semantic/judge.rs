//! The judge model seam and its OpenRouter implementation.

use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{PruneError, Result};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Boxed future returned by [`Judge::complete`] (dyn-compatible).
pub type JudgeFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// A model that answers a single prompt with raw text.
pub trait Judge: Send + Sync {
    fn complete<'a>(&'a self, model: &'a str, prompt: &'a str, max_tokens: u32)
    -> JudgeFuture<'a>;
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Judge backed by the OpenRouter chat completions API.
pub struct OpenRouterJudge {
    client: reqwest::Client,
    api_key: String,
    url: String,
    referer: String,
    title: String,
}

impl OpenRouterJudge {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("cinch-prune/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PruneError::Judge(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            url: OPENROUTER_URL.to_string(),
            referer: "https://github.com/cinch-rs".to_string(),
            title: "cinch-prune".to_string(),
        })
    }

    /// Point at a different OpenAI-compatible endpoint (builder pattern).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    async fn chat(&self, model: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": 0.0,
            "response_format": {"type": "json_object"},
        });
        debug!("Judge request: model={model}, prompt={} chars", prompt.len());

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| PruneError::Judge(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PruneError::Judge(format!("failed to read response: {e}")))?;
        debug!(
            "Judge response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );
        trace!("Judge raw response: {text}");

        if !status.is_success() {
            return Err(PruneError::Judge(format!("HTTP {status}: {text}")));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| PruneError::Judge(format!("failed to parse response: {e}")))?;
        if let Some(err) = parsed.error {
            return Err(PruneError::Judge(format!("API error: {}", err.message)));
        }
        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .ok_or_else(|| PruneError::Judge("empty response".into()))
    }
}

impl Judge for OpenRouterJudge {
    fn complete<'a>(
        &'a self,
        model: &'a str,
        prompt: &'a str,
        max_tokens: u32,
    ) -> JudgeFuture<'a> {
        Box::pin(self.chat(model, prompt, max_tokens))
    }
}
