//! Machine translation of generated content.
//! `TranslationCache` is the entry point; `RemoteTranslator` adapts the
//! backend that produces new translations.

pub mod cache;
pub mod normalize;
pub mod remote;
pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::{CacheEntry, CacheStats, ContentKey, TranslationCache};
pub use remote::ModelTranslator;
pub use store::{CacheStore, MemoryStore, SqliteStore, StoreError};

/// Languages the dashboard renders. English is the source language of all
/// generated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en-IN")]
    English,
    #[serde(rename = "hi-IN")]
    Hindi,
}

impl Language {
    pub const SOURCE: Language = Language::English;

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en-IN",
            Language::Hindi => "hi-IN",
        }
    }

    /// Accepts the full locale code or the bare language subtag.
    pub fn from_code(code: &str) -> Option<Language> {
        match code.trim().to_ascii_lowercase().as_str() {
            "en-in" | "en" => Some(Language::English),
            "hi-in" | "hi" => Some(Language::Hindi),
            _ => None,
        }
    }

    /// English name used in model prompts.
    pub fn display_name(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Hindi => "Hindi",
        }
    }

    pub fn is_source(self) -> bool {
        self == Language::SOURCE
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("translation failed: {0}")]
    RemoteTranslationFailed(String),
    #[error("translation service is not configured")]
    NotConfigured,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Adapter for a backend that translates one piece of text.
#[async_trait]
pub trait RemoteTranslator: Send + Sync {
    async fn translate(&self, text: &str, target: Language) -> Result<String, TranslateError>;
}
