//! cropsight: crop photo diagnosis and cached AI translation.
//! Library root: module wiring, tracing setup, and the shared application
//! context used by the HTTP server and the CLI.

pub mod analysis;
pub mod cancellation;
pub mod config;
pub mod http;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod state_machine;
pub mod translate;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::fmt::MakeWriter;
use tracing::{info, warn};

use analysis::AnalysisOrchestrator;
use config::{AppConfig, LoggingConfig};
use metrics::MetricsRegistry;
use model::{ModelInvoker, OpenAiCompatClient};
use translate::{CacheStore, MemoryStore, ModelTranslator, RemoteTranslator, SqliteStore, TranslationCache};

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured
/// level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Load configuration under a temporary stderr subscriber, so loading
/// diagnostics are visible before [`init_tracing`] runs.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    load_config_with_writer(path, std::io::stderr)
}

fn load_config_with_writer<W>(path: Option<&Path>, writer: W) -> anyhow::Result<AppConfig>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cropsight=info"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(bootstrap, || AppConfig::load(path))
}

/// Shared services, built once from configuration.
pub struct AppContext {
    pub config: AppConfig,
    pub metrics: Arc<MetricsRegistry>,
    pub orchestrator: Arc<AnalysisOrchestrator>,
    /// Direct translator for the stateless translation endpoint.
    pub translator: Option<Arc<dyn RemoteTranslator>>,
    pub cache: Arc<TranslationCache>,
}

impl AppContext {
    pub fn build(config: AppConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new());

        let analysis_invoker: Option<Arc<dyn ModelInvoker>> = match config.analysis_client() {
            Some(client) => {
                info!(endpoint = %client.base_url, "analysis model client initialized");
                Some(Arc::new(OpenAiCompatClient::new(client).context("analysis client")?))
            }
            None => {
                warn!("analysis model client not configured, image analysis disabled");
                None
            }
        };
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            analysis_invoker,
            config.analysis_settings(),
            Arc::clone(&metrics),
        ));

        let translator: Option<Arc<dyn RemoteTranslator>> = match config.translation_client() {
            Some(client) => {
                info!(endpoint = %client.base_url, model = %config.translation.model, "translation client initialized");
                let invoker = Arc::new(OpenAiCompatClient::new(client).context("translation client")?);
                Some(Arc::new(ModelTranslator::new(invoker, config.translation_params())))
            }
            None => {
                warn!("translation client not configured, remote translation disabled");
                None
            }
        };

        let store = open_store(&config)?;
        let cache = Arc::new(
            TranslationCache::new(store, translator.clone())
                .with_debounce(config.debounce_window())
                .with_metrics(Arc::clone(&metrics)),
        );

        Ok(Self {
            config,
            metrics,
            orchestrator,
            translator,
            cache,
        })
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    let Some(path) = config.cache.path.as_deref() else {
        info!("no cache path configured, translation cache kept in memory");
        let store = MemoryStore::new();
        store.set_quota(config.cache.quota_bytes.map(|q| q as usize));
        return Ok(Arc::new(store));
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
    }
    let store = SqliteStore::open(path, config.cache.quota_bytes).context("failed to open translation cache store")?;
    Ok(Arc::new(store))
}
