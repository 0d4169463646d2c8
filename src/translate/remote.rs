//! `RemoteTranslator` backed by a chat-completions model.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::normalize::PlaceholderProtector;
use super::{Language, RemoteTranslator, TranslateError};
use crate::model::{ModelError, ModelInvoker, ModelParams, ModelRequest};

pub struct ModelTranslator {
    invoker: Arc<dyn ModelInvoker>,
    params: ModelParams,
    protector: PlaceholderProtector,
}

impl ModelTranslator {
    pub fn new(invoker: Arc<dyn ModelInvoker>, params: ModelParams) -> Self {
        Self {
            invoker,
            params,
            protector: PlaceholderProtector::new(),
        }
    }
}

#[async_trait]
impl RemoteTranslator for ModelTranslator {
    async fn translate(&self, text: &str, target: Language) -> Result<String, TranslateError> {
        if target.is_source() {
            return Ok(text.to_string());
        }
        if text.trim().is_empty() {
            return Err(TranslateError::InvalidInput("text is empty".into()));
        }

        let (protected, placeholders) = self.protector.protect(text);
        let request = ModelRequest::text(self.params.clone(), translation_prompt(&protected, target));
        let started = Instant::now();

        // Translation calls run to completion; nothing cancels them.
        let output = match self.invoker.invoke(request, &CancellationToken::new()).await {
            Ok(output) => output,
            Err(ModelError::EmptyResponse) => String::new(),
            Err(e) => {
                warn!(error = %e, target = %target, "remote translation failed");
                return Err(TranslateError::RemoteTranslationFailed(e.to_string()));
            }
        };

        let translated = self.protector.restore(strip_wrapping_quotes(&output), &placeholders);
        debug!(
            target = %target,
            placeholders = placeholders.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote translation complete"
        );
        Ok(translated)
    }
}

fn translation_prompt(text: &str, target: Language) -> String {
    let lang = target.display_name();
    format!(
        "Translate the following text from English to {lang}.
Maintain the original formatting and structure.
Keep technical terms in English but translate everything else.
Leave placeholder tags such as <<PH0>> exactly as they are.
Do not add any explanations or comments, just return the translated text.
Ensure the translation is natural and fluent in {lang}.

Text to translate: \"{text}\""
    )
}

/// Models often echo the quotes the prompt put around the text.
fn strip_wrapping_quotes(output: &str) -> &str {
    let trimmed = output.trim();
    ['"', '“']
        .iter()
        .zip(['"', '”'])
        .find_map(|(open, close)| trimmed.strip_prefix(*open)?.strip_suffix(close))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct EchoInvoker {
        reply: Result<String, ModelError>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelInvoker for EchoInvoker {
        async fn invoke(&self, request: ModelRequest, _cancel: &CancellationToken) -> Result<String, ModelError> {
            self.prompts.lock().push(request.prompt);
            self.reply.clone()
        }
    }

    fn translator(reply: Result<String, ModelError>) -> (ModelTranslator, Arc<EchoInvoker>) {
        let invoker = Arc::new(EchoInvoker {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        let translator = ModelTranslator::new(invoker.clone(), ModelParams::new("test-model", 0.1));
        (translator, invoker)
    }

    #[tokio::test]
    async fn source_target_echoes_without_call() {
        let (translator, invoker) = translator(Ok("unused".into()));
        let out = translator.translate("Water the field", Language::English).await.unwrap();
        assert_eq!(out, "Water the field");
        assert!(invoker.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn placeholders_are_restored() {
        let (translator, invoker) = translator(Ok("\"<<PH0>> किलो यूरिया डालें\"".into()));
        let out = translator.translate("Apply 25 kg urea", Language::Hindi).await.unwrap();
        assert_eq!(out, "25 किलो यूरिया डालें");

        let prompts = invoker.prompts.lock();
        assert!(prompts[0].contains("from English to Hindi"));
        assert!(prompts[0].contains("\"Apply <<PH0>> kg urea\""));
    }

    #[tokio::test]
    async fn upstream_failure_is_reported() {
        let (translator, _) = translator(Err(ModelError::Upstream("503".into())));
        let err = translator.translate("Check soil moisture", Language::Hindi).await.unwrap_err();
        assert!(matches!(err, TranslateError::RemoteTranslationFailed(_)));
    }

    #[tokio::test]
    async fn empty_model_output_is_empty_translation() {
        let (translator, _) = translator(Err(ModelError::EmptyResponse));
        assert_eq!(translator.translate("Check soil", Language::Hindi).await.unwrap(), "");
    }

    #[test]
    fn wrapping_quotes_are_stripped() {
        assert_eq!(strip_wrapping_quotes("  \"नमस्ते\" "), "नमस्ते");
        assert_eq!(strip_wrapping_quotes("“नमस्ते”"), "नमस्ते");
        assert_eq!(strip_wrapping_quotes("\"a\" and \"b"), "\"a\" and \"b");
    }
}
