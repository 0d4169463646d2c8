//! Two-stage analysis: a vision call diagnoses the photo, a text call turns the
//! diagnosis into the structured JSON shape, and the extractor decodes it.
//! Validation runs before any network call. The stage sequence races a
//! deadline measured from request start; when the deadline wins, the
//! cancellation token fires and the in-flight call is dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::extract::{extract_diagnosis, Extraction, ExtractionPath};
use super::image::{validate_image, ImagePayload};
use super::prompts::{crop_label, diagnose_prompt, recommend_prompt};
use super::{AnalysisError, DiagnosisResult, Stage};
use crate::cancellation::Deadline;
use crate::metrics::{metric_names, new_request_id, MetricsRegistry};
use crate::model::{ModelError, ModelInvoker, ModelParams, ModelRequest};

/// Model choices and limits for the analysis path.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub vision: ModelParams,
    pub recommend: ModelParams,
    pub deadline: Duration,
    pub max_image_bytes: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            vision: ModelParams::new("Qwen/Qwen2-VL-7B-Instruct", 0.2),
            recommend: ModelParams::new("meta-llama/Meta-Llama-3.1-8B-Instruct", 0.3),
            deadline: Duration::from_secs(30),
            max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

/// One analysis request as received from a caller.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub image_data: Option<String>,
    pub crop_type: Option<String>,
    pub field_name: Option<String>,
}

/// Successful analysis outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub request_id: String,
    pub diagnosis: DiagnosisResult,
    /// Diagnose-stage text, kept for display and audit.
    pub raw_analysis: String,
    pub extraction: ExtractionPath,
    pub elapsed_ms: u64,
}

pub struct AnalysisOrchestrator {
    invoker: Option<Arc<dyn ModelInvoker>>,
    settings: AnalysisSettings,
    metrics: Arc<MetricsRegistry>,
}

impl AnalysisOrchestrator {
    /// `invoker` is None when the model service is not configured; every
    /// request then fails with `ConfigurationMissing` after input validation.
    pub fn new(
        invoker: Option<Arc<dyn ModelInvoker>>,
        settings: AnalysisSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            invoker,
            settings,
            metrics,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.invoker.is_some()
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, AnalysisError> {
        let deadline = Deadline::new(self.settings.deadline);
        let request_id = new_request_id();
        let crop = crop_label(request.crop_type.as_deref()).to_string();
        let span = info_span!(
            "analysis",
            request_id = %request_id,
            crop = %crop,
            field = request.field_name.as_deref().unwrap_or("")
        );

        async move {
            let image = validate_image(request.image_data.as_deref(), self.settings.max_image_bytes)?;
            let invoker = self.invoker.as_deref().ok_or_else(|| {
                warn!("analysis requested but model service is not configured");
                AnalysisError::ConfigurationMissing
            })?;
            info!(image_bytes = image.decoded_len, mime = %image.mime, "analysis started");

            let outcome = deadline
                .race(self.run_stages(invoker, &image, &crop, deadline.token()))
                .await;
            let elapsed = deadline.elapsed();

            let (extraction, raw_analysis) = match outcome {
                Ok(stages) => stages?,
                Err(elapsed) => {
                    warn!(after_ms = elapsed.after.as_millis() as u64, "analysis timed out");
                    self.metrics.record_duration(metric_names::ANALYSIS_TIMEOUT, elapsed.after);
                    return Err(AnalysisError::Timeout { after: elapsed.after });
                }
            };

            self.metrics.record_duration(metric_names::ANALYSIS_DONE, elapsed);
            if extraction.is_fallback() {
                self.metrics.record(metric_names::EXTRACTION_FALLBACK, 1.0);
            }
            info!(
                elapsed_ms = elapsed.as_millis() as u64,
                extraction = ?extraction.path(),
                "analysis complete"
            );

            Ok(AnalysisReport {
                request_id: request_id.clone(),
                extraction: extraction.path(),
                diagnosis: extraction.into_result(),
                raw_analysis,
                elapsed_ms: elapsed.as_millis() as u64,
            })
        }
        .instrument(span)
        .await
    }

    /// Diagnose then recommend then extract. Returns the extraction and the
    /// diagnose-stage text.
    async fn run_stages(
        &self,
        invoker: &dyn ModelInvoker,
        image: &ImagePayload,
        crop: &str,
        cancel: &CancellationToken,
    ) -> Result<(Extraction, String), AnalysisError> {
        let span = self.metrics.span(metric_names::DIAGNOSE_DONE);
        let diagnose = ModelRequest::vision(self.settings.vision.clone(), diagnose_prompt(crop), image.data_uri());
        let analysis_text = invoker
            .invoke(diagnose, cancel)
            .await
            .map_err(|source| stage_error(Stage::Diagnose, source))?;
        span.finish();

        let span = self.metrics.span(metric_names::RECOMMEND_DONE);
        let recommend = ModelRequest::text(self.settings.recommend.clone(), recommend_prompt(&analysis_text, crop));
        let recommendations = invoker
            .invoke(recommend, cancel)
            .await
            .map_err(|source| stage_error(Stage::Recommend, source))?;
        span.finish();

        Ok((extract_diagnosis(&recommendations), analysis_text))
    }
}

fn stage_error(stage: Stage, source: ModelError) -> AnalysisError {
    warn!(%stage, error = %source, "analysis stage failed");
    AnalysisError::Upstream { stage, source }
}
