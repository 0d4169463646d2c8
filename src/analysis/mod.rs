//! Crop photo analysis: diagnose → recommend → extract, under a deadline.

pub mod extract;
pub mod image;
pub mod orchestrator;
pub mod prompts;

use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::model::ModelError;

pub use extract::{extract_diagnosis, fallback_diagnosis, Extraction, ExtractionPath, FallbackReason};
pub use orchestrator::{AnalysisOrchestrator, AnalysisReport, AnalysisRequest, AnalysisSettings};

/// Overall crop health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl<'de> Deserialize<'de> for HealthStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "warning" => Ok(HealthStatus::Warning),
            "critical" => Ok(HealthStatus::Critical),
            other => Err(D::Error::custom(format!("unknown health status `{other}`"))),
        }
    }
}

/// Structured diagnosis of one crop photo. Field names follow the JSON shape
/// the recommend stage is asked to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisResult {
    pub status: HealthStatus,
    #[serde(deserialize_with = "deserialize_confidence")]
    pub confidence: u8,
    #[serde(default)]
    pub disease_name: Option<String>,
    pub description: String,
    pub recommendations: Vec<String>,
    pub preventive_measures: Vec<String>,
    pub expected_recovery_time: String,
    pub potential_yield_impact: String,
}

/// Accepts a number or a numeric string (optionally with `%`), rounds it and
/// clamps it to 0..=100.
fn deserialize_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .map_err(D::Error::custom)?,
    };
    if !value.is_finite() {
        return Err(D::Error::custom("confidence is not a finite number"));
    }
    Ok(value.clamp(0.0, 100.0).round() as u8)
}

/// The two model-backed stages of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Diagnose,
    Recommend,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Diagnose => write!(f, "diagnose"),
            Stage::Recommend => write!(f, "recommend"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("image is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("API configuration is missing")]
    ConfigurationMissing,

    #[error("{stage} stage failed: {source}")]
    Upstream {
        stage: Stage,
        #[source]
        source: ModelError,
    },

    #[error("processing timeout after {}ms - please try with a smaller image or try again", .after.as_millis())]
    Timeout { after: Duration },
}

impl AnalysisError {
    /// Stable classification code for callers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::MissingInput(_) => "MissingInput",
            AnalysisError::PayloadTooLarge { .. } => "PayloadTooLarge",
            AnalysisError::ConfigurationMissing => "ConfigurationMissing",
            AnalysisError::Upstream { .. } => "UpstreamError",
            AnalysisError::Timeout { .. } => "Timeout",
        }
    }

    /// Whether a user-facing retry makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Upstream { .. } | AnalysisError::Timeout { .. })
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            AnalysisError::Upstream { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(confidence: &str, status: &str) -> String {
        format!(
            r#"{{"status":"{status}","confidence":{confidence},"diseaseName":null,"description":"d",
            "recommendations":["a"],"preventiveMeasures":["b"],"expectedRecoveryTime":"2 weeks",
            "potentialYieldImpact":"low"}}"#
        )
    }

    #[test]
    fn confidence_is_rounded_and_clamped() {
        let r: DiagnosisResult = serde_json::from_str(&sample_json("91.6", "healthy")).unwrap();
        assert_eq!(r.confidence, 92);
        let r: DiagnosisResult = serde_json::from_str(&sample_json("140", "healthy")).unwrap();
        assert_eq!(r.confidence, 100);
        let r: DiagnosisResult = serde_json::from_str(&sample_json("\"85%\"", "healthy")).unwrap();
        assert_eq!(r.confidence, 85);
    }

    #[test]
    fn status_is_case_insensitive() {
        let r: DiagnosisResult = serde_json::from_str(&sample_json("50", "Critical")).unwrap();
        assert_eq!(r.status, HealthStatus::Critical);
        assert!(serde_json::from_str::<DiagnosisResult>(&sample_json("50", "sick")).is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let r: DiagnosisResult = serde_json::from_str(&sample_json("70", "warning")).unwrap();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "warning");
        assert!(v.get("preventiveMeasures").is_some());
        assert!(v.get("diseaseName").unwrap().is_null());
    }

    #[test]
    fn error_classification() {
        let err = AnalysisError::Upstream {
            stage: Stage::Diagnose,
            source: ModelError::EmptyResponse,
        };
        assert_eq!(err.kind(), "UpstreamError");
        assert_eq!(err.stage(), Some(Stage::Diagnose));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("diagnose"));
        assert!(!AnalysisError::ConfigurationMissing.is_retryable());
    }
}
