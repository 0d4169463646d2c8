//! HTTP surface: image analysis, stateless translation, metrics, health.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::analysis::{AnalysisError, AnalysisRequest, DiagnosisResult};
use crate::translate::{Language, TranslateError};
use crate::AppContext;

/// Headroom over the image limit for base64 expansion and the JSON envelope.
const BODY_OVERHEAD: usize = 1024 * 1024;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let body_limit = ctx.orchestrator.settings().max_image_bytes * 2 + BODY_OVERHEAD;
    Router::new()
        .route("/api/process-image", post(process_image))
        .route("/api/translate", post(translate))
        .route("/api/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind and serve until ctrl-c.
pub async fn serve(ctx: Arc<AppContext>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}

// ============================================================================
// Image analysis
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessImageBody {
    pub image_data: Option<String>,
    pub crop_type: Option<String>,
    pub field_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImageResponse {
    pub success: bool,
    pub request_id: String,
    pub analysis_result: DiagnosisResult,
    pub raw_analysis: String,
}

async fn process_image(
    State(ctx): State<Arc<AppContext>>,
    body: Result<Json<ProcessImageBody>, JsonRejection>,
) -> Result<Json<ProcessImageResponse>, AnalysisApiError> {
    let Json(body) = body.map_err(AnalysisApiError::Body)?;
    let report = ctx
        .orchestrator
        .analyze(AnalysisRequest {
            image_data: body.image_data,
            crop_type: body.crop_type,
            field_name: body.field_name,
        })
        .await?;

    Ok(Json(ProcessImageResponse {
        success: true,
        request_id: report.request_id,
        analysis_result: report.diagnosis,
        raw_analysis: report.raw_analysis,
    }))
}

pub enum AnalysisApiError {
    /// The request body never reached the handler: oversized or not JSON.
    Body(JsonRejection),
    Analysis(AnalysisError),
}

impl From<AnalysisError> for AnalysisApiError {
    fn from(err: AnalysisError) -> Self {
        Self::Analysis(err)
    }
}

impl IntoResponse for AnalysisApiError {
    fn into_response(self) -> Response {
        let err = match self {
            Self::Body(rejection) => {
                let body = Json(serde_json::json!({
                    "success": false,
                    "error": "Invalid request body",
                    "details": rejection.body_text(),
                    "kind": "InvalidBody",
                    "retryable": false,
                }));
                return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
            }
            Self::Analysis(err) => err,
        };
        let (status, message) = match &err {
            AnalysisError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, err.to_string()),
            AnalysisError::MissingInput(_) => (StatusCode::INTERNAL_SERVER_ERROR, "No image data provided".to_string()),
            AnalysisError::PayloadTooLarge { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Image is too large".to_string()),
            AnalysisError::ConfigurationMissing => {
                (StatusCode::INTERNAL_SERVER_ERROR, "API configuration missing".to_string())
            }
            AnalysisError::Upstream { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to process image".to_string()),
        };

        let body = Json(serde_json::json!({
            "success": false,
            "error": message,
            "details": err.to_string(),
            "kind": err.kind(),
            "retryable": err.is_retryable(),
        }));

        (status, body).into_response()
    }
}

// ============================================================================
// Translation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranslateBody {
    pub text: Option<String>,
    pub target_language: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponse {
    pub translated_text: String,
}

async fn translate(
    State(ctx): State<Arc<AppContext>>,
    body: Result<Json<TranslateBody>, JsonRejection>,
) -> Result<Json<TranslateResponse>, TranslateApiError> {
    let Json(body) = body.map_err(|rejection| TranslateApiError {
        status: StatusCode::BAD_REQUEST,
        message: "Invalid request body".to_string(),
        details: Some(rejection.body_text()),
    })?;
    let text = body
        .text
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TranslateApiError::bad_request("Text is required"))?;
    let code = body
        .target_language
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| TranslateApiError::bad_request("Target language is required"))?;
    let target = Language::from_code(&code)
        .ok_or_else(|| TranslateApiError::bad_request(format!("Unsupported target language: {code}")))?;

    // English content stays as is.
    if target.is_source() {
        return Ok(Json(TranslateResponse { translated_text: text }));
    }

    let translator = ctx.translator.as_ref().ok_or_else(|| TranslateApiError::from(TranslateError::NotConfigured))?;
    let translated_text = translator.translate(&text, target).await?;
    Ok(Json(TranslateResponse { translated_text }))
}

pub struct TranslateApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl TranslateApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }
}

impl From<TranslateError> for TranslateApiError {
    fn from(err: TranslateError) -> Self {
        match &err {
            TranslateError::InvalidInput(msg) => Self::bad_request(msg.clone()),
            TranslateError::NotConfigured => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Translation service not configured. Please set GEMINI_API_KEY environment variable."
                    .to_string(),
                details: None,
            },
            TranslateError::RemoteTranslationFailed(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Translation failed".to_string(),
                details: Some(err.to_string()),
            },
        }
    }
}

impl IntoResponse for TranslateApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message,
            "translatedText": "",
        });
        if let Some(details) = self.details {
            body["details"] = serde_json::Value::String(details);
        }
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Metrics and health
// ============================================================================

async fn metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "timings": ctx.metrics.summary(),
        "translationCache": ctx.cache.stats(),
    }))
}

async fn healthz(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "analysisConfigured": ctx.orchestrator.is_configured(),
        "translationConfigured": ctx.translator.is_some(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisOrchestrator, AnalysisSettings};
    use crate::config::AppConfig;
    use crate::metrics::MetricsRegistry;
    use crate::model::{ModelError, ModelInvoker, ModelRequest};
    use crate::translate::{MemoryStore, RemoteTranslator, TranslationCache};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const RECOMMEND_JSON: &str = r#"{"status":"critical","confidence":"88%","diseaseName":"Leaf Blast","description":"Spindle lesions on leaves","recommendations":["Apply tricyclazole"],"preventiveMeasures":["Avoid excess nitrogen"],"expectedRecoveryTime":"2-3 weeks","potentialYieldImpact":"Up to 30% loss"}"#;

    struct StubInvoker {
        delay: Duration,
    }

    #[async_trait]
    impl ModelInvoker for StubInvoker {
        async fn invoke(&self, request: ModelRequest, cancel: &CancellationToken) -> Result<String, ModelError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            }
            Ok(if request.image_url.is_some() {
                "Health Status: critical".to_string()
            } else {
                RECOMMEND_JSON.to_string()
            })
        }
    }

    struct StubTranslator;

    #[async_trait]
    impl RemoteTranslator for StubTranslator {
        async fn translate(&self, text: &str, _: Language) -> Result<String, TranslateError> {
            if text.contains("fail") {
                return Err(TranslateError::RemoteTranslationFailed("quota exhausted".into()));
            }
            Ok(format!("हिंदी: {text}"))
        }
    }

    fn context(invoker_delay: Option<Duration>, translator: bool) -> Arc<AppContext> {
        let metrics = Arc::new(MetricsRegistry::new());
        let invoker = invoker_delay.map(|delay| Arc::new(StubInvoker { delay }) as Arc<dyn ModelInvoker>);
        let settings = AnalysisSettings {
            deadline: Duration::from_millis(100),
            ..AnalysisSettings::default()
        };
        let translator = translator.then(|| Arc::new(StubTranslator) as Arc<dyn RemoteTranslator>);
        Arc::new(AppContext {
            config: AppConfig::default(),
            orchestrator: Arc::new(AnalysisOrchestrator::new(invoker, settings, Arc::clone(&metrics))),
            cache: Arc::new(TranslationCache::new(Arc::new(MemoryStore::new()), translator.clone())),
            translator,
            metrics,
        })
    }

    async fn post_json(ctx: Arc<AppContext>, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        post_raw(ctx, uri, body.to_string()).await
    }

    async fn post_raw(ctx: Arc<AppContext>, uri: &str, body: String) -> (StatusCode, serde_json::Value) {
        let response = router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Context whose body limit is a little over 1 MiB.
    fn small_limit_context() -> Arc<AppContext> {
        let ctx = context(Some(Duration::ZERO), true);
        let metrics = Arc::clone(&ctx.metrics);
        let settings = AnalysisSettings {
            max_image_bytes: 1024,
            ..AnalysisSettings::default()
        };
        Arc::new(AppContext {
            config: AppConfig::default(),
            orchestrator: Arc::new(AnalysisOrchestrator::new(None, settings, Arc::clone(&metrics))),
            cache: Arc::clone(&ctx.cache),
            translator: ctx.translator.clone(),
            metrics,
        })
    }

    fn image() -> String {
        format!("data:image/jpeg;base64,{}", STANDARD.encode([3u8; 48]))
    }

    #[tokio::test]
    async fn process_image_success() {
        let ctx = context(Some(Duration::from_millis(1)), false);
        let (status, body) = post_json(
            ctx,
            "/api/process-image",
            serde_json::json!({"imageData": image(), "cropType": "rice", "fieldName": "North plot"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["analysisResult"]["status"], "critical");
        assert_eq!(body["analysisResult"]["confidence"], 88);
        assert_eq!(body["analysisResult"]["diseaseName"], "Leaf Blast");
        assert_eq!(body["rawAnalysis"], "Health Status: critical");
    }

    #[tokio::test]
    async fn process_image_missing_image_is_500() {
        let (status, body) = post_json(context(Some(Duration::ZERO), false), "/api/process-image", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "MissingInput");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn process_image_unconfigured_is_500() {
        let (status, body) = post_json(context(None, false), "/api/process-image", serde_json::json!({"imageData": image()})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "API configuration missing");
    }

    #[tokio::test]
    async fn process_image_timeout_is_504() {
        let ctx = context(Some(Duration::from_secs(5)), false);
        let (status, body) = post_json(ctx, "/api/process-image", serde_json::json!({"imageData": image()})).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["kind"], "Timeout");
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn process_image_malformed_body_keeps_envelope() {
        let (status, body) = post_raw(context(Some(Duration::ZERO), false), "/api/process-image", "{not json".into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Invalid request body");
        assert_eq!(body["kind"], "InvalidBody");
        assert!(!body["details"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_image_over_body_limit_keeps_envelope() {
        let huge = serde_json::json!({"imageData": "A".repeat(1536 * 1024)});
        let (status, body) = post_json(small_limit_context(), "/api/process-image", huge).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "InvalidBody");
    }

    #[tokio::test]
    async fn translate_bad_bodies_keep_envelope() {
        let (status, body) = post_raw(context(None, true), "/api/translate", "{not json".into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid request body");
        assert_eq!(body["translatedText"], "");

        let huge = serde_json::json!({"text": "A".repeat(1536 * 1024), "targetLanguage": "hi-IN"});
        let (status, body) = post_json(small_limit_context(), "/api/translate", huge).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["translatedText"], "");
    }

    #[tokio::test]
    async fn translate_validates_input() {
        let ctx = context(None, true);
        let (status, body) = post_json(ctx.clone(), "/api/translate", serde_json::json!({"targetLanguage": "hi-IN"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Text is required");
        assert_eq!(body["translatedText"], "");

        let (status, body) = post_json(ctx, "/api/translate", serde_json::json!({"text": "hello"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Target language is required");
    }

    #[tokio::test]
    async fn translate_source_language_echoes() {
        let (status, body) = post_json(
            context(None, false),
            "/api/translate",
            serde_json::json!({"text": "Water early", "targetLanguage": "en-IN"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["translatedText"], "Water early");
    }

    #[tokio::test]
    async fn translate_to_hindi() {
        let (status, body) = post_json(
            context(None, true),
            "/api/translate",
            serde_json::json!({"text": "Water early", "targetLanguage": "hi-IN"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["translatedText"], "हिंदी: Water early");
    }

    #[tokio::test]
    async fn translate_failures_are_500() {
        let (status, body) = post_json(
            context(None, false),
            "/api/translate",
            serde_json::json!({"text": "Water early", "targetLanguage": "hi-IN"}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["translatedText"], "");

        let (status, body) = post_json(
            context(None, true),
            "/api/translate",
            serde_json::json!({"text": "please fail", "targetLanguage": "hi-IN"}),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Translation failed");
        assert!(body["details"].as_str().unwrap().contains("quota exhausted"));
    }

    #[tokio::test]
    async fn healthz_reports_configuration() {
        let response = router(context(None, true))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["analysisConfigured"], false);
        assert_eq!(body["translationConfigured"], true);
    }
}
