//! Prompt construction for the diagnose and recommend stages.

const UNKNOWN_CROP: &str = "unknown";

/// Crop type as shown to the model; blank input becomes "unknown".
pub fn crop_label(crop_type: Option<&str>) -> &str {
    crop_type.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(UNKNOWN_CROP)
}

/// Vision prompt asking for a structured but free-text assessment.
pub fn diagnose_prompt(crop: &str) -> String {
    format!(
        "Analyze this crop image for disease detection. The crop type is: {crop}.

Please provide a detailed assessment including:
1. Whether the crop appears healthy or diseased
2. If diseased, identify the specific disease with high confidence
3. Visible symptoms present in the image (spots, wilting, discoloration, etc.)
4. Severity level of the disease or issue (mild, moderate, severe)
5. Growth stage of the crop

Format your response as a structured analysis that can be parsed, including:
- Health Status: (healthy/warning/critical)
- Confidence Level: (percentage)
- Disease Name: (if applicable)
- Symptoms: (detailed list)
- Severity: (mild/moderate/severe)
- Growth Stage: (description)
- Additional Notes: (any other relevant observations)"
    )
}

/// Text prompt turning the diagnosis into the `DiagnosisResult` JSON shape.
pub fn recommend_prompt(analysis: &str, crop: &str) -> String {
    format!(
        r#"Based on this crop analysis, provide detailed treatment recommendations and management strategies:

Analysis: {analysis}
Crop Type: {crop}

Return your response as a JSON object with this exact structure:
{{
  "status": "healthy" | "warning" | "critical",
  "confidence": <number 0-100>,
  "diseaseName": "<disease name or null if healthy>",
  "description": "<detailed description>",
  "recommendations": ["<action item 1>", "<action item 2>", ...],
  "preventiveMeasures": ["<preventive measure 1>", "<preventive measure 2>", ...],
  "expectedRecoveryTime": "<time estimate>",
  "potentialYieldImpact": "<impact description>"
}}

Be specific and practical with the recommendations."#
    )
}
