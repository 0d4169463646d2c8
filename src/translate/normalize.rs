//! Language detection and placeholder protection.
//! Tokens a translator must not touch (URLs, emails, inline code, numbers
//! with units) are swapped for placeholder tags before the remote call and
//! restored afterwards.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::Language;

/// Dominant language of `text` when whatlang is confident and it is one of
/// the languages the dashboard renders.
pub fn detect_language(text: &str) -> Option<Language> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    match info.lang() {
        whatlang::Lang::Eng => Some(Language::English),
        whatlang::Lang::Hin => Some(Language::Hindi),
        _ => None,
    }
}

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub tag: String,
    pub original: String,
}

fn protected_tokens() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"https?://[^\s,)\]]+",
            r"|[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
            r"|`[^`]+`",
            r"|[₹$€£]?\d+(?:[.,]\d+)*(?:%|(?i:kg|ha|mm|cm|km|ml|mg|g|l|°c)\b)?",
        ))
        .expect("placeholder pattern is valid")
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderProtector;

impl PlaceholderProtector {
    pub fn new() -> Self {
        Self
    }

    /// Replace protected tokens with `<<PH0>>`, `<<PH1>>`, ... in order of
    /// appearance.
    pub fn protect(&self, text: &str) -> (String, Vec<Placeholder>) {
        let mut entries = Vec::new();
        let protected = protected_tokens().replace_all(text, |caps: &Captures| {
            let tag = format!("<<PH{}>>", entries.len());
            entries.push(Placeholder {
                tag: tag.clone(),
                original: caps[0].to_string(),
            });
            tag
        });
        (protected.into_owned(), entries)
    }

    /// Put the original tokens back. Tags the translator dropped stay dropped.
    pub fn restore(&self, text: &str, entries: &[Placeholder]) -> String {
        entries
            .iter()
            .fold(text.to_string(), |acc, entry| acc.replace(&entry.tag, &entry.original))
    }
}
