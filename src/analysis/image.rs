//! Image payload validation: data-URI parsing, base64 decoding, size limit.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;

use super::AnalysisError;

const DEFAULT_MIME: &str = "image/jpeg";

/// A validated image ready to be attached to a vision call.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime: String,
    pub decoded_len: usize,
    data_uri: String,
}

impl ImagePayload {
    /// The image as a `data:` URI, whatever form it arrived in.
    pub fn data_uri(&self) -> &str {
        &self.data_uri
    }
}

fn data_uri_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^data:(?P<mime>[\w.+-]+/[\w.+-]+)?(?:;[\w.+-]+=[\w.+-]+)*;base64,(?P<data>.*)$")
            .expect("data URI pattern is valid")
    })
}

/// Validate an image given as a data URI or bare base64.
/// Rejects blank input, undecodable data, and payloads whose decoded size
/// exceeds `max_bytes`. The size check runs on the encoded length first so an
/// oversized upload is rejected without decoding it.
pub fn validate_image(raw: Option<&str>, max_bytes: usize) -> Result<ImagePayload, AnalysisError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AnalysisError::MissingInput("no image data provided".into()))?;

    let (mime, encoded) = match data_uri_pattern().captures(raw) {
        Some(caps) => (
            caps.name("mime").map(|m| m.as_str()).unwrap_or(DEFAULT_MIME).to_string(),
            caps.name("data").map(|m| m.as_str()).unwrap_or_default(),
        ),
        None if raw.starts_with("data:") => {
            return Err(AnalysisError::MissingInput("image data URI is not base64 encoded".into()));
        }
        None => (DEFAULT_MIME.to_string(), raw),
    };

    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(AnalysisError::MissingInput("image data is empty".into()));
    }

    let estimated = estimated_decoded_len(&compact);
    if estimated > max_bytes {
        return Err(AnalysisError::PayloadTooLarge {
            size: estimated,
            limit: max_bytes,
        });
    }

    let decoded = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| AnalysisError::MissingInput(format!("image data is not valid base64: {e}")))?;
    if decoded.len() > max_bytes {
        return Err(AnalysisError::PayloadTooLarge {
            size: decoded.len(),
            limit: max_bytes,
        });
    }

    Ok(ImagePayload {
        data_uri: format!("data:{mime};base64,{compact}"),
        mime,
        decoded_len: decoded.len(),
    })
}

/// Decoded byte count implied by a padded base64 string.
fn estimated_decoded_len(encoded: &str) -> usize {
    let padding = encoded.bytes().rev().take_while(|&b| b == b'=').count().min(2);
    (encoded.len() / 4 * 3).saturating_sub(padding)
}
