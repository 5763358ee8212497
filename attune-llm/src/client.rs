//! LLM Client: OpenAI-compatible HTTP backend.
//!
//! Speaks the `/v1/chat/completions`, `/v1/embeddings` and `/v1/models`
//! endpoints, which most hosted providers and local gateways implement.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::CompletionBackend;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, JsonRequest, TokenLogprob};

/// Where requests go.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    /// OpenAI-compatible API.
    OpenAiCompatible {
        /// Base URL without the `/v1` suffix.
        base_url: String,
        /// Bearer token; `None` means every call reports a missing credential.
        api_key: Option<String>,
    },
    /// No provider: every call fails with `Unavailable`.
    None,
}

/// Models and time bounds for an [`LlmClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Model used for first-token logprob probes.
    pub probe_model: String,
    /// Model used for structured analysis.
    pub analysis_model: String,
    /// Embedding model.
    pub embedding_model: String,
    /// Bound on a normal call.
    pub request_timeout: Duration,
    /// Bound on the credential probe.
    pub auth_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            probe_model: "gpt-4o-mini".into(),
            analysis_model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            request_timeout: Duration::from_secs(15),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client implementing [`CompletionBackend`].
pub struct LlmClient {
    provider: LlmProvider,
    http: Client,
    options: ClientOptions,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base_url = match &self.provider {
            LlmProvider::OpenAiCompatible { base_url, .. } => base_url.as_str(),
            LlmProvider::None => "none",
        };
        f.debug_struct("LlmClient")
            .field("base_url", &base_url)
            .field("has_key", &self.has_credential())
            .field("options", &self.options)
            .finish()
    }
}

// Wire shapes (only the fields we read).

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceLogprobs {
    content: Vec<PositionLogprobs>,
}

#[derive(Deserialize)]
struct PositionLogprobs {
    top_logprobs: Vec<TokenLogprob>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl LlmClient {
    /// Create a client.
    ///
    /// # Errors
    /// Returns `LlmError::Config` if the HTTP client cannot be built.
    pub fn new(provider: LlmProvider, options: ClientOptions) -> Result<Self> {
        let http = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            provider,
            http,
            options,
        })
    }

    /// Create a client with no backend (all calls fail, callers skip the stage).
    ///
    /// # Errors
    /// Returns `LlmError::Config` if the HTTP client cannot be built.
    pub fn none() -> Result<Self> {
        Self::new(LlmProvider::None, ClientOptions::default())
    }

    /// Whether an API key is configured.
    #[must_use]
    pub fn has_credential(&self) -> bool {
        matches!(&self.provider, LlmProvider::OpenAiCompatible { api_key: Some(_), .. })
    }

    /// Check whether the provider has a backend configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }

    /// Probe the model listing to confirm the key works.
    ///
    /// Bounded by the auth timeout.
    ///
    /// # Errors
    /// `MissingCredential` when no key is set, `InvalidCredential` on
    /// 401/403, `Timeout` when the probe exceeds its bound, and the usual
    /// transport errors otherwise.
    pub async fn verify_credential(&self) -> Result<()> {
        let (base_url, api_key) = self.endpoint("credential check")?;
        let bound = self.options.auth_timeout;
        let request = self
            .http
            .get(format!("{base_url}/v1/models"))
            .bearer_auth(api_key)
            .timeout(bound);
        let start = Instant::now();
        let response = match tokio::time::timeout(bound, request.send()).await {
            Ok(sent) => sent.map_err(|e| transport_error(e, bound))?,
            Err(_) => return Err(LlmError::Timeout(millis(bound))),
        };
        check_status(response).await?;
        debug!(elapsed_ms = millis(start.elapsed()), "credential verified");
        Ok(())
    }

    fn endpoint(&self, feature: &str) -> Result<(&str, &str)> {
        match &self.provider {
            LlmProvider::None => Err(LlmError::Unavailable("no LLM provider configured".into())),
            LlmProvider::OpenAiCompatible { api_key: None, .. } => {
                Err(LlmError::MissingCredential(feature.to_string()))
            }
            LlmProvider::OpenAiCompatible {
                base_url,
                api_key: Some(key),
            } => Ok((base_url.trim_end_matches('/'), key.as_str())),
        }
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response> {
        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, self.options.request_timeout))?;
        let response = check_status(response).await;
        match &response {
            Ok(_) => debug!(operation, elapsed_ms = millis(start.elapsed()), "provider call ok"),
            Err(e) => warn!(operation, elapsed_ms = millis(start.elapsed()), error = %e, "provider call failed"),
        }
        response
    }

    async fn chat(&self, feature: &str, body: serde_json::Value) -> Result<ChatResponse> {
        let (base_url, api_key) = self.endpoint(feature)?;
        let request = self
            .http
            .post(format!("{base_url}/v1/chat/completions"))
            .bearer_auth(api_key)
            .json(&body);
        let response = self.send(request, feature).await?;
        response.json().await.map_err(|e| LlmError::Parse(e.to_string()))
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn first_token_logprobs(&self, messages: &[ChatMessage], top_k: u8) -> Result<Vec<TokenLogprob>> {
        let body = json!({
            "model": self.options.probe_model,
            "messages": messages,
            "max_tokens": 1,
            "temperature": 0,
            "logprobs": true,
            "top_logprobs": top_k,
        });
        let response = self.chat("surprise scoring", body).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.logprobs)
            .and_then(|l| l.content.into_iter().next())
            .map(|p| p.top_logprobs)
            .filter(|top| !top.is_empty())
            .ok_or_else(|| LlmError::Parse("response carried no first-token logprobs".into()))
    }

    async fn complete_json(&self, request: &JsonRequest) -> Result<String> {
        let body = json!({
            "model": self.options.analysis_model,
            "messages": [
                ChatMessage::system(&request.system),
                ChatMessage::user(&request.user),
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "response_format": { "type": "json_object" },
        });
        let response = self.chat("conflict analysis", body).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| LlmError::Parse("response carried no message content".into()))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (base_url, api_key) = self.endpoint("embeddings")?;
        let request = self
            .http
            .post(format!("{base_url}/v1/embeddings"))
            .bearer_auth(api_key)
            .json(&json!({ "model": self.options.embedding_model, "input": texts }));
        let response = self.send(request, "embeddings").await?;
        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
        if parsed.data.len() != texts.len() {
            return Err(LlmError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn name(&self) -> &str {
        match self.provider {
            LlmProvider::OpenAiCompatible { .. } => "openai-compatible",
            LlmProvider::None => "none",
        }
    }
}

/// Map a non-success status to the error taxonomy.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {status}: {}", truncate(&body, 200));
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after, message },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::InvalidCredential(message),
        s if s.is_server_error() => LlmError::Unavailable(message),
        _ => LlmError::RequestFailed(message),
    })
}

fn transport_error(err: reqwest::Error, bound: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(millis(bound))
    } else {
        err.into()
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
