//! Scripted in-process backend for tests and offline dry runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::CompletionBackend;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, JsonRequest, TokenLogprob};

type LogprobScript = dyn Fn(&[ChatMessage]) -> Result<Vec<TokenLogprob>> + Send + Sync;

/// A [`CompletionBackend`] whose answers are scripted.
///
/// - logprob probes call a closure over the prompt messages (default: a
///   fixed two-token distribution);
/// - JSON completions pop a queue, falling back to a "no conflict" verdict;
/// - embeddings are a deterministic letter histogram.
pub struct ScriptedBackend {
    logprobs: Box<LogprobScript>,
    json: Mutex<VecDeque<Result<String>>>,
    latency: Duration,
    probe_calls: AtomicUsize,
    json_calls: AtomicUsize,
    embed_calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("queued_json", &self.json.lock().len())
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Backend with default answers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            logprobs: Box::new(|_| {
                Ok(vec![
                    TokenLogprob::new("Sure", (0.7_f64).ln()),
                    TokenLogprob::new("I", (0.3_f64).ln()),
                ])
            }),
            json: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            probe_calls: AtomicUsize::new(0),
            json_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
        }
    }

    /// Answer logprob probes with `script`.
    #[must_use]
    pub fn with_logprobs<F>(mut self, script: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Result<Vec<TokenLogprob>> + Send + Sync + 'static,
    {
        self.logprobs = Box::new(script);
        self
    }

    /// Sleep this long (tokio time) before every answer.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue the next JSON completion.
    pub fn push_json(&self, response: Result<String>) {
        self.json.lock().push_back(response);
    }

    /// Logprob probes served so far.
    #[must_use]
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// JSON completions served so far.
    #[must_use]
    pub fn json_calls(&self) -> usize {
        self.json_calls.load(Ordering::SeqCst)
    }

    /// Embedding batches served so far.
    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// Joined text of every message, for scripts that key on prompt content.
#[must_use]
pub fn prompt_text(messages: &[ChatMessage]) -> String {
    messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn first_token_logprobs(&self, messages: &[ChatMessage], top_k: u8) -> Result<Vec<TokenLogprob>> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut top = (self.logprobs)(messages)?;
        top.truncate(usize::from(top_k));
        Ok(top)
    }

    async fn complete_json(&self, _request: &JsonRequest) -> Result<String> {
        self.json_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let next = self.json.lock().pop_front();
        next.unwrap_or_else(|| {
            Ok(r#"{"has_conflict": false, "conflicting_ids": [], "resolution_type": "none", "consolidated_content": "", "explanation": "scripted default"}"#.to_string())
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if texts.iter().any(|t| t.contains("<embed-fail>")) {
            return Err(LlmError::Unavailable("scripted embedding failure".into()));
        }
        Ok(texts.iter().map(|t| letter_histogram(t)).collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[allow(clippy::cast_precision_loss)]
fn letter_histogram(text: &str) -> Vec<f32> {
    let mut v = vec![0.0_f32; 26];
    for c in text.chars().filter(char::is_ascii_alphabetic) {
        let idx = usize::from(c.to_ascii_lowercase() as u8 - b'a');
        v[idx] += 1.0;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_json_pops_in_order_then_defaults() {
        let backend = ScriptedBackend::new();
        backend.push_json(Ok("{\"a\":1}".into()));
        backend.push_json(Err(LlmError::Timeout(5)));
        let req = JsonRequest::new("s", "u");
        assert_eq!(backend.complete_json(&req).await.expect("first"), "{\"a\":1}");
        assert!(backend.complete_json(&req).await.is_err());
        assert!(backend.complete_json(&req).await.expect("default").contains("has_conflict"));
        assert_eq!(backend.json_calls(), 3);
    }

    #[tokio::test]
    async fn logprob_script_sees_messages_and_top_k_truncates() {
        let backend = ScriptedBackend::new().with_logprobs(|msgs| {
            let text = prompt_text(msgs);
            let n = if text.contains("cats") { 3 } else { 1 };
            Ok((0..n).map(|i| TokenLogprob::new(format!("t{i}"), -1.0)).collect())
        });
        let out = backend
            .first_token_logprobs(&[ChatMessage::system("Has cats")], 2)
            .await
            .expect("probe");
        assert_eq!(out.len(), 2);
        assert_eq!(backend.probe_calls(), 1);
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let backend = ScriptedBackend::new();
        let a = backend.embed(&["abc".into(), "abc".into()]).await.expect("embed");
        assert_eq!(a[0], a[1]);
        assert_eq!(a[0].len(), 26);
    }
}
