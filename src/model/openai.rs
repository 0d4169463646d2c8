//! OpenAI-compatible chat/completions client.
//! Connection pooling via reqwest, a per-call timeout shorter than any caller
//! deadline, simple request spacing, and cancellation through a token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ModelError, ModelInvoker, ModelRequest};

/// Endpoint and transport settings for one OpenAI-compatible service.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub api_key: String,
    pub call_timeout: Duration,
    /// Minimum spacing between requests. Zero disables spacing.
    pub min_interval: Duration,
}

impl OpenAiCompatConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            call_timeout: Duration::from_secs(25),
            min_interval: Duration::ZERO,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: OpenAiCompatConfig,
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
}

impl OpenAiCompatClient {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, ModelError> {
        if config.base_url.trim().is_empty() || config.api_key.trim().is_empty() {
            return Err(ModelError::Upstream("endpoint or API key not configured".into()));
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| ModelError::Upstream(e.to_string()))?;

        Ok(Self {
            http,
            config,
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
        })
    }

    async fn spacing_wait(&self) {
        if self.config.min_interval.is_zero() {
            return;
        }
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.config.min_interval;
    }

    async fn send(&self, body: &Value) -> Result<String, ModelError> {
        let response = self
            .http
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Upstream(format!("call timed out after {:?}", self.config.call_timeout))
                } else {
                    ModelError::Upstream(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "model call rejected");
            return Err(ModelError::Upstream(format!(
                "unexpected status {}: {}",
                status,
                body_text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ModelError::Upstream(format!("malformed completion body: {e}")))?;
        first_choice_text(parsed)
    }
}

#[async_trait]
impl ModelInvoker for OpenAiCompatClient {
    async fn invoke(&self, request: ModelRequest, cancel: &CancellationToken) -> Result<String, ModelError> {
        self.spacing_wait().await;
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }

        let body = build_body(&request);
        let start = Instant::now();
        let result = tokio::select! {
            r = self.send(&body) => r,
            _ = cancel.cancelled() => Err(ModelError::Cancelled),
        };
        debug!(
            model = %request.params.model,
            vision = request.image_url.is_some(),
            ok = result.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model_call_settled"
        );
        result
    }
}

/// Build the chat/completions request body. Vision requests send the prompt
/// and the image as a multi-part user message.
pub(crate) fn build_body(request: &ModelRequest) -> Value {
    let content = match &request.image_url {
        Some(url) => json!([
            { "type": "text", "text": request.prompt },
            { "type": "image_url", "image_url": { "url": url } }
        ]),
        None => Value::String(request.prompt.clone()),
    };

    let mut body = json!({
        "model": request.params.model,
        "temperature": request.params.temperature,
        "messages": [ { "role": "user", "content": content } ],
    });
    if let Some(max_tokens) = request.params.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

fn first_choice_text(completion: ChatCompletion) -> Result<String, ModelError> {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or(ModelError::EmptyResponse)
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParams;

    #[test]
    fn vision_body_carries_image_part() {
        let req = ModelRequest::vision(ModelParams::new("vl-model", 0.2), "look", "data:image/png;base64,AAAA");
        let body = build_body(&req);
        assert_eq!(body["model"], "vl-model");
        assert_eq!(body["messages"][0]["content"][0]["text"], "look");
        assert_eq!(body["messages"][0]["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn text_body_is_plain_string() {
        let mut params = ModelParams::new("text-model", 0.3);
        params.max_tokens = Some(512);
        let body = build_body(&ModelRequest::text(params, "hello"));
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn blank_or_missing_content_is_empty_response() {
        let blank: ChatCompletion =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"   "}}]}"#).unwrap();
        assert_eq!(first_choice_text(blank), Err(ModelError::EmptyResponse));

        let none: ChatCompletion = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(first_choice_text(none), Err(ModelError::EmptyResponse));

        let null: ChatCompletion =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert_eq!(first_choice_text(null), Err(ModelError::EmptyResponse));
    }

    #[test]
    fn content_is_trimmed() {
        let ok: ChatCompletion =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  Health Status: healthy \n"}}]}"#)
                .unwrap();
        assert_eq!(first_choice_text(ok).unwrap(), "Health Status: healthy");
    }

    #[test]
    fn missing_credentials_rejected() {
        let err = OpenAiCompatClient::new(OpenAiCompatConfig::new("https://example.test/v1", "")).err();
        assert!(matches!(err, Some(ModelError::Upstream(_))));
    }

    #[test]
    fn completions_url_joins_cleanly() {
        let cfg = OpenAiCompatConfig::new("https://api.example.test/v1/", "k");
        assert_eq!(cfg.completions_url(), "https://api.example.test/v1/chat/completions");
    }
}
