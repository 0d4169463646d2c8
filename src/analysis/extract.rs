//! Turns recommend-stage text into a `DiagnosisResult`.
//! Never fails: when no usable JSON object is found the fixed fallback
//! diagnosis is returned, tagged so callers can tell the two paths apart.

use serde::Serialize;
use tracing::{debug, warn};

use super::{DiagnosisResult, HealthStatus};

/// Why extraction fell back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    NoJsonObject,
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Parsed(DiagnosisResult),
    Fallback {
        result: DiagnosisResult,
        reason: FallbackReason,
    },
}

/// Which path produced the result, for reports and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionPath {
    Parsed,
    Fallback,
}

impl Extraction {
    pub fn result(&self) -> &DiagnosisResult {
        match self {
            Extraction::Parsed(result) | Extraction::Fallback { result, .. } => result,
        }
    }

    pub fn into_result(self) -> DiagnosisResult {
        match self {
            Extraction::Parsed(result) | Extraction::Fallback { result, .. } => result,
        }
    }

    pub fn path(&self) -> ExtractionPath {
        match self {
            Extraction::Parsed(_) => ExtractionPath::Parsed,
            Extraction::Fallback { .. } => ExtractionPath::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.path() == ExtractionPath::Fallback
    }
}

/// Conservative diagnosis used whenever the model output cannot be decoded.
pub fn fallback_diagnosis() -> DiagnosisResult {
    DiagnosisResult {
        status: HealthStatus::Warning,
        confidence: 70,
        disease_name: None,
        description: "The analysis detected potential issues but couldn't provide a definitive diagnosis."
            .to_string(),
        recommendations: vec![
            "Consult with a local agricultural expert".to_string(),
            "Monitor the affected areas closely".to_string(),
            "Ensure proper irrigation and nutrition".to_string(),
        ],
        preventive_measures: vec![
            "Maintain good field hygiene".to_string(),
            "Practice crop rotation".to_string(),
            "Use disease-resistant varieties when possible".to_string(),
        ],
        expected_recovery_time: "Unknown without specific diagnosis".to_string(),
        potential_yield_impact: "Impact uncertain - monitor closely".to_string(),
    }
}

/// Decode the first balanced JSON object in `text`, or fall back.
pub fn extract_diagnosis(text: &str) -> Extraction {
    let Some(span) = first_json_object(text) else {
        warn!(text_len = text.len(), "no JSON object in recommendations, using fallback");
        return Extraction::Fallback {
            result: fallback_diagnosis(),
            reason: FallbackReason::NoJsonObject,
        };
    };

    match serde_json::from_str::<DiagnosisResult>(span) {
        Ok(mut result) => {
            result.disease_name = result
                .disease_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("null"));
            debug!(status = ?result.status, confidence = result.confidence, "diagnosis parsed");
            Extraction::Parsed(result)
        }
        Err(e) => {
            warn!(error = %e, "recommendations JSON did not decode, using fallback");
            Extraction::Fallback {
                result: fallback_diagnosis(),
                reason: FallbackReason::Decode(e.to_string()),
            }
        }
    }
}

/// The outermost `{...}` span starting at the first `{`, with braces inside
/// string literals ignored. None when that object never closes.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"status":"healthy","confidence":91,"diseaseName":null,
        "description":"Leaves look vigorous","recommendations":["Keep irrigation schedule"],
        "preventiveMeasures":["Scout weekly"],"expectedRecoveryTime":"N/A",
        "potentialYieldImpact":"None expected"}"#;

    #[test]
    fn leading_prose_is_ignored() {
        let text = format!("Here is the analysis: {FULL}\nLet me know if you need more.");
        let extraction = extract_diagnosis(&text);
        assert_eq!(extraction.path(), ExtractionPath::Parsed);
        let result = extraction.into_result();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.confidence, 91);
        assert_eq!(result.disease_name, None);
        assert_eq!(result.recommendations, vec!["Keep irrigation schedule"]);
    }

    #[test]
    fn fenced_json_is_parsed() {
        let text = format!("```json\n{FULL}\n```");
        assert!(!extract_diagnosis(&text).is_fallback());
    }

    #[test]
    fn braces_inside_strings_do_not_end_the_span() {
        let text = r#"x {"a":"}{","b":{"c":1}} trailing }"#;
        assert_eq!(first_json_object(text), Some(r#"{"a":"}{","b":{"c":1}}"#));
    }

    #[test]
    fn escaped_quotes_stay_in_string() {
        let text = r#"{"a":"say \"}\" now"}"#;
        assert_eq!(first_json_object(text), Some(text));
    }

    #[test]
    fn unbalanced_object_has_no_span() {
        assert_eq!(first_json_object("{\"status\": \"healthy\""), None);
        assert_eq!(first_json_object("no braces here"), None);
    }

    #[test]
    fn non_json_text_falls_back() {
        let extraction = extract_diagnosis("The crop looks stressed, maybe blight.");
        assert_eq!(
            extraction,
            Extraction::Fallback {
                result: fallback_diagnosis(),
                reason: FallbackReason::NoJsonObject
            }
        );
        assert_eq!(extraction.result().status, HealthStatus::Warning);
        assert_eq!(extraction.result().confidence, 70);
    }

    #[test]
    fn missing_required_fields_fall_back() {
        let extraction = extract_diagnosis(r#"{"status":"critical","confidence":88}"#);
        assert!(matches!(
            extraction,
            Extraction::Fallback {
                reason: FallbackReason::Decode(_),
                ..
            }
        ));
        assert_eq!(extraction.result().status, HealthStatus::Warning);
    }

    #[test]
    fn invalid_json_falls_back() {
        let extraction = extract_diagnosis("{status: healthy, confidence: high}");
        assert!(extraction.is_fallback());
        assert_eq!(extraction.into_result(), fallback_diagnosis());
    }

    #[test]
    fn odd_inputs_never_panic() {
        for input in ["", "}", "{{{{", "\"{\"", "{\"a\":\"\\", "}{", "ü{ü}ü"] {
            let extraction = extract_diagnosis(input);
            assert_eq!(extraction.result().status, HealthStatus::Warning);
        }
    }

    #[test]
    fn disease_name_is_trimmed_or_dropped() {
        let text = FULL.replace("\"diseaseName\":null", "\"diseaseName\":\"  Leaf Rust \"");
        assert_eq!(
            extract_diagnosis(&text).into_result().disease_name.as_deref(),
            Some("Leaf Rust")
        );
        let text = FULL.replace("\"diseaseName\":null", "\"diseaseName\":\"\"");
        assert_eq!(extract_diagnosis(&text).into_result().disease_name, None);
    }
}
