//! Model invocation: one bounded call to a text or vision generating service.
//! No retry happens here; callers decide whether to try again.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use openai::{OpenAiCompatClient, OpenAiCompatConfig};

/// Model selection and sampling for one call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ModelParams {
    pub fn new(model: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens: None,
        }
    }
}

/// A single prompt, optionally with an image attached as a data URI.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub params: ModelParams,
    pub prompt: String,
    pub image_url: Option<String>,
}

impl ModelRequest {
    pub fn text(params: ModelParams, prompt: impl Into<String>) -> Self {
        Self {
            params,
            prompt: prompt.into(),
            image_url: None,
        }
    }

    pub fn vision(params: ModelParams, prompt: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            params,
            prompt: prompt.into(),
            image_url: Some(image_url.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model returned no usable content")]
    EmptyResponse,
    #[error("upstream call failed: {0}")]
    Upstream(String),
    #[error("model call cancelled")]
    Cancelled,
}

/// Adapter for a text/vision generating backend.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Perform one call and return the raw, trimmed text output.
    async fn invoke(&self, request: ModelRequest, cancel: &CancellationToken) -> Result<String, ModelError>;
}
