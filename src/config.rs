//! Application configuration: TOML file, `.env`, then environment overrides.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::AnalysisSettings;
use crate::model::{ModelParams, OpenAiCompatConfig};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub analysis: AnalysisConfig,
    pub translation: TranslationConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub json: bool,
}

/// Vision + text model service used for crop analysis.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub api_key: String,
    pub vision_model: String,
    pub vision_temperature: f32,
    pub recommend_model: String,
    pub recommend_temperature: f32,
    pub max_tokens: Option<u32>,
    pub deadline_ms: u64,
    pub call_timeout_ms: u64,
    pub min_interval_ms: u64,
    pub max_image_bytes: usize,
}

/// Model service used for Hindi translation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub call_timeout_ms: u64,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file for the persisted cache. None keeps the cache in memory.
    pub path: Option<PathBuf>,
    pub quota_bytes: Option<u64>,
}

impl AppConfig {
    /// Load configuration.
    ///
    /// Loading order:
    /// 1. `.env` file, if present
    /// 2. the TOML file given, or `cropsight.toml` / `conf/cropsight.toml`
    /// 3. environment variable overrides
    /// 4. validation
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        if let Ok(env_file) = dotenvy::dotenv() {
            tracing::debug!(path = %env_file.display(), "loaded .env");
        }

        let mut config = match path.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => Self::from_toml(&path)?,
            None => {
                tracing::warn!("configuration file not found, using defaults");
                AppConfig::default()
            }
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, anyhow::Error> {
        Ok(toml::from_str(content)?)
    }

    fn from_toml(path: &Path) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        ["cropsight.toml", "conf/cropsight.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Supported variables:
    /// - NEBIUS_API_KEY / NEBIUS_ENDPOINT: analysis model service
    /// - GEMINI_API_KEY: translation model service key
    /// - CROPSIGHT_TRANSLATION_ENDPOINT, CROPSIGHT_TRANSLATION_MODEL
    /// - CROPSIGHT_HOST, CROPSIGHT_PORT
    /// - CROPSIGHT_LOG_LEVEL, CROPSIGHT_LOG_JSON
    /// - CROPSIGHT_ANALYSIS_DEADLINE_MS, CROPSIGHT_MAX_IMAGE_BYTES
    /// - CROPSIGHT_DEBOUNCE_MS
    /// - CROPSIGHT_CACHE_PATH, CROPSIGHT_CACHE_QUOTA_BYTES
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("NEBIUS_API_KEY") {
            self.analysis.api_key = key;
            tracing::info!("override analysis.api_key from env");
        }
        if let Some(endpoint) = lookup("NEBIUS_ENDPOINT") {
            self.analysis.endpoint = endpoint;
            tracing::info!(endpoint = %self.analysis.endpoint, "override analysis.endpoint from env");
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.translation.api_key = key;
            tracing::info!("override translation.api_key from env");
        }
        if let Some(endpoint) = lookup("CROPSIGHT_TRANSLATION_ENDPOINT") {
            self.translation.endpoint = endpoint;
        }
        if let Some(model) = lookup("CROPSIGHT_TRANSLATION_MODEL") {
            self.translation.model = model;
        }
        if let Some(host) = lookup("CROPSIGHT_HOST") {
            self.server.host = host;
        }
        if let Some(level) = lookup("CROPSIGHT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = lookup("CROPSIGHT_CACHE_PATH") {
            self.cache.path = Some(PathBuf::from(path));
        }

        override_parsed(&lookup, "CROPSIGHT_PORT", &mut self.server.port);
        override_parsed(&lookup, "CROPSIGHT_LOG_JSON", &mut self.logging.json);
        override_parsed(&lookup, "CROPSIGHT_ANALYSIS_DEADLINE_MS", &mut self.analysis.deadline_ms);
        override_parsed(&lookup, "CROPSIGHT_MAX_IMAGE_BYTES", &mut self.analysis.max_image_bytes);
        override_parsed(&lookup, "CROPSIGHT_DEBOUNCE_MS", &mut self.translation.debounce_ms);

        if let Some(raw) = lookup("CROPSIGHT_CACHE_QUOTA_BYTES") {
            match raw.parse() {
                Ok(quota) => self.cache.quota_bytes = Some(quota),
                Err(e) => tracing::warn!("invalid CROPSIGHT_CACHE_QUOTA_BYTES '{raw}': {e}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        if self.analysis.deadline_ms == 0 {
            anyhow::bail!("analysis.deadline_ms must be > 0");
        }
        if self.analysis.max_image_bytes == 0 {
            anyhow::bail!("analysis.max_image_bytes must be > 0");
        }
        if self.analysis.call_timeout_ms >= self.analysis.deadline_ms {
            tracing::warn!(
                call_timeout_ms = self.analysis.call_timeout_ms,
                deadline_ms = self.analysis.deadline_ms,
                "per-call timeout is not shorter than the analysis deadline"
            );
        }
        if !(0.0..=2.0).contains(&self.analysis.vision_temperature)
            || !(0.0..=2.0).contains(&self.analysis.recommend_temperature)
            || !(0.0..=2.0).contains(&self.translation.temperature)
        {
            anyhow::bail!("model temperatures must be within 0.0..=2.0");
        }
        if !self.analysis_configured() {
            tracing::warn!("analysis model service not configured, set NEBIUS_API_KEY and NEBIUS_ENDPOINT");
        }
        if !self.translation_configured() {
            tracing::warn!("translation service not configured, set GEMINI_API_KEY");
        }
        Ok(())
    }

    pub fn analysis_configured(&self) -> bool {
        !self.analysis.endpoint.trim().is_empty() && !self.analysis.api_key.trim().is_empty()
    }

    pub fn translation_configured(&self) -> bool {
        !self.translation.endpoint.trim().is_empty() && !self.translation.api_key.trim().is_empty()
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        let a = &self.analysis;
        let mut vision = ModelParams::new(a.vision_model.clone(), a.vision_temperature);
        vision.max_tokens = a.max_tokens;
        let mut recommend = ModelParams::new(a.recommend_model.clone(), a.recommend_temperature);
        recommend.max_tokens = a.max_tokens;
        AnalysisSettings {
            vision,
            recommend,
            deadline: Duration::from_millis(a.deadline_ms),
            max_image_bytes: a.max_image_bytes,
        }
    }

    /// Client settings for the analysis service, or None when unconfigured.
    pub fn analysis_client(&self) -> Option<OpenAiCompatConfig> {
        self.analysis_configured().then(|| {
            OpenAiCompatConfig::new(self.analysis.endpoint.clone(), self.analysis.api_key.clone())
                .with_call_timeout(Duration::from_millis(self.analysis.call_timeout_ms))
                .with_min_interval(Duration::from_millis(self.analysis.min_interval_ms))
        })
    }

    pub fn translation_client(&self) -> Option<OpenAiCompatConfig> {
        self.translation_configured().then(|| {
            OpenAiCompatConfig::new(self.translation.endpoint.clone(), self.translation.api_key.clone())
                .with_call_timeout(Duration::from_millis(self.translation.call_timeout_ms))
        })
    }

    pub fn translation_params(&self) -> ModelParams {
        ModelParams::new(self.translation.model.clone(), self.translation.temperature)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.translation.debounce_ms)
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => {
            *target = value;
            tracing::info!("override from env {name}: {target}");
        }
        Err(e) => tracing::warn!("invalid {name} '{raw}': {e} (keep {target})"),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "cropsight=debug,tower_http=info".to_string(),
            json: false,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.studio.nebius.ai/v1".to_string(),
            api_key: String::new(),
            vision_model: "Qwen/Qwen2-VL-7B-Instruct".to_string(),
            vision_temperature: 0.2,
            recommend_model: "meta-llama/Meta-Llama-3.1-8B-Instruct".to_string(),
            recommend_temperature: 0.3,
            max_tokens: None,
            deadline_ms: 30_000,
            call_timeout_ms: 25_000,
            min_interval_ms: 0,
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.2,
            call_timeout_ms: 25_000,
            debounce_ms: 300,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data/cropsight-cache.db")),
            quota_bytes: Some(5 * 1024 * 1024),
        }
    }
}
