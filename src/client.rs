//! HTTP client for OpenAI-compatible chat-completion endpoints.
//!
//! Every outbound call goes token-bucket first, then POST, then the retry
//! engine decides whether a failure is worth another attempt. The
//! [`CompletionApi`] trait is the seam between the pipeline and this
//! module; tests swap in a scripted implementation.

use std::{collections::BTreeMap, error, fmt, sync::Arc, time::Duration};

use reqwest::{StatusCode, header};

use crate::{
    config::{ModelConfig, ProviderLimits},
    prelude::*,
    provider::provider_for,
    rate_limit::{ProviderLimit, RateLimiterPool},
    retry::{RetryPolicy, backoff_sleep},
    secrets,
    streaming,
    wire::{
        ChatCompletionsRequest, ChatCompletionsResponse, ChatMessage, ErrorEnvelope,
        ResponseFormat, Usage,
    },
};

/// HTTP statuses worth retrying. Everything else at or above 400 is
/// treated as terminal.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// What a chat endpoint returned, reduced to the parts we consume.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    /// Reasoning-model output, kept separate from the content.
    pub reasoning: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

/// An error from a chat endpoint or the transport underneath it.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status_code: Option<u16>,
    pub message: String,
    /// The provider's error `type` field, when one was returned.
    pub kind: Option<String>,
    pub code: Option<String>,
    pub retryable: bool,
    pub cancelled: bool,
}

impl ApiError {
    pub fn cancelled() -> Self {
        Self {
            status_code: None,
            message: "request cancelled".to_owned(),
            kind: None,
            code: None,
            retryable: false,
            cancelled: true,
        }
    }

    /// A failure that will not get better by itself.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
            kind: None,
            code: None,
            retryable: false,
            cancelled: false,
        }
    }

    /// A failure worth retrying: stream hiccups, parse glitches, and the
    /// like.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
            kind: None,
            code: None,
            retryable: true,
            cancelled: false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }

    fn from_status(status: StatusCode, body: &str) -> Self {
        let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let (message, kind, code) = match envelope {
            Some(envelope) => {
                let code = envelope.error.code.map(|code| match code {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
                (envelope.error.message, envelope.error.kind, code)
            }
            None => {
                let mut message = body.trim().to_owned();
                if message.len() > 300 {
                    message.truncate(300);
                }
                (message, None, None)
            }
        };
        Self {
            status_code: Some(status.as_u16()),
            message,
            kind,
            code,
            retryable: RETRYABLE_STATUSES.contains(&status.as_u16()),
            cancelled: false,
        }
    }

    fn transport(err: reqwest::Error) -> Self {
        Self {
            status_code: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
            kind: None,
            code: None,
            // Connection resets, DNS hiccups, and timeouts are all worth
            // another attempt; the budget bounds them.
            retryable: true,
            cancelled: false,
        }
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self {
            message: format!("giving up after {} attempts: {}", attempts, self.message),
            retryable: false,
            ..self
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "API error (HTTP {}): {}", status, self.message),
            None => write!(f, "API error: {}", self.message),
        }
    }
}

impl error::Error for ApiError {}

/// The seam between the pipeline and the HTTP layer.
#[async_trait]
pub trait CompletionApi: Send + Sync + 'static {
    /// Run one chat-completion call, with rate limiting and retries.
    async fn chat_completion(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ApiError>;

    /// Like [`Self::chat_completion`], for JSON-producing calls: the
    /// model's `structure_temperature` takes over when set.
    async fn chat_completion_structured(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ApiError> {
        self.chat_completion(&spec.for_structured_output(), messages, cancel)
            .await
    }
}

/// The real client.
pub struct ChatClient {
    http: reqwest::Client,
    limiter: Arc<RateLimiterPool>,
    providers: BTreeMap<String, ProviderLimits>,
}

impl ChatClient {
    pub fn new(
        limiter: Arc<RateLimiterPool>,
        providers: BTreeMap<String, ProviderLimits>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            limiter,
            providers,
        })
    }

    /// One attempt: token, POST, parse. The retry loop lives in
    /// [`CompletionApi::chat_completion`].
    async fn execute_once(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ApiError> {
        let provider = provider_for(&spec.base_url);
        let provider_limit = self.providers.get(provider).map(|limits| ProviderLimit {
            name: provider,
            rpm: limits.rpm,
            burst_percent: limits.burst_percent,
        });

        let waited = self
            .limiter
            .wait(cancel, &spec.identity(), spec.rpm, provider_limit)
            .await
            .map_err(|_| ApiError::cancelled())?;
        if waited > Duration::from_secs(1) {
            debug!(model = %spec.name, waited = ?waited, "rate limiter delayed request");
        }

        let request = ChatCompletionsRequest {
            model: spec.name.clone(),
            messages: messages.to_vec(),
            temperature: spec.temperature,
            top_p: spec.top_p,
            max_tokens: spec.max_tokens,
            n: 1,
            response_format: spec.json_mode.then(ResponseFormat::json_object),
            stream: spec.use_streaming.then_some(true),
        };

        let url = format!(
            "{}/chat/completions",
            spec.base_url.trim_end_matches('/')
        );
        let mut builder = self
            .http
            .post(&url)
            .timeout(spec.http_timeout())
            .json(&request);
        if let Some(key) = secrets::api_key_for(&spec.base_url) {
            builder = builder.bearer_auth(key);
        }
        if spec.use_streaming {
            builder = builder.header(header::ACCEPT, "text/event-stream");
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::cancelled()),
            response = builder.send() => response.map_err(ApiError::transport)?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        if spec.use_streaming {
            streaming::drain(response, cancel).await
        } else {
            parse_response(spec, response, cancel).await
        }
    }
}

/// Read and reduce a non-streaming response body.
async fn parse_response(
    spec: &ModelConfig,
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<ChatResponse, ApiError> {
    let envelope: ChatCompletionsResponse = tokio::select! {
        _ = cancel.cancelled() => return Err(ApiError::cancelled()),
        body = response.json() => body.map_err(ApiError::transport)?,
    };
    let choice = envelope
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::terminal("response contained no choices"))?;
    if choice.finish_reason.as_deref() == Some("length") {
        warn!(
            model = %spec.name,
            max_tokens = spec.max_tokens,
            "response was truncated at the token limit"
        );
    }
    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
        finish_reason: choice.finish_reason,
        usage: envelope.usage.unwrap_or_default(),
    })
}

#[async_trait]
impl CompletionApi for ChatClient {
    async fn chat_completion(
        &self,
        spec: &ModelConfig,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ApiError> {
        let policy = RetryPolicy::new(spec.max_retries, spec.max_backoff());
        let mut failures = 0u32;
        loop {
            match self.execute_once(spec, messages, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) if err.cancelled => return Err(err),
                Err(err) if err.retryable && policy.retries.allows(failures) => {
                    failures += 1;
                    let delay =
                        policy.backoff_with_jitter(failures, err.is_rate_limited());
                    warn!(
                        model = %spec.name,
                        failures,
                        delay = ?delay,
                        error = %err,
                        "request failed; backing off"
                    );
                    if backoff_sleep(cancel, delay).await.is_err() {
                        return Err(ApiError::cancelled());
                    }
                }
                Err(err) if err.retryable => {
                    // Retryable, but the budget is spent.
                    return Err(err.exhausted(failures + 1));
                }
                Err(err) => return Err(err),
            }
        }
    }
}
