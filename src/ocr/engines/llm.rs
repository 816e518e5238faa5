//! OCR using a vision-capable LLM.

use std::sync::{Arc, LazyLock};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use schemars::JsonSchema;

use crate::{
    async_utils::io::JsonObject,
    config::LlmConfig,
    llm_client::LlmClient,
    ocr::{OcrImage, OcrOptions, OcrRecognition, Priority, ProviderFailure},
    prelude::*,
    prompt::ChatPrompt,
};

use super::{OcrProvider, ProviderDescriptor};

/// Our built-in transcription prompt.
static TRANSCRIBE_PROMPT: LazyLock<ChatPrompt> = LazyLock::new(|| {
    ChatPrompt::from_toml(include_str!("llm/transcribe_prompt.toml"))
        .expect("failed to parse built-in transcription prompt")
});

/// Convert binary data to a `data:` URL.
fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}

/// What we ask the model to return.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct TranscriptionResponse {
    /// The complete text of the answer, exactly as written.
    text: String,

    /// How sure you are of the transcription, from 0 to 1.
    confidence: f32,

    /// Words which were hard to read.
    uncertain_words: Vec<String>,
}

/// An OCR provider which asks an LLM to transcribe the image.
pub struct LlmOcrProvider {
    /// Our static description.
    descriptor: ProviderDescriptor,

    /// The model we talk to.
    client: LlmClient,
}

impl LlmOcrProvider {
    /// Create a new LLM-based provider. The descriptor's `model` and
    /// `rate_limit` override the global LLM settings.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(descriptor: ProviderDescriptor, llm: &LlmConfig) -> Result<Arc<dyn OcrProvider>> {
        let mut llm = llm.clone();
        if let Some(rate_limit) = &descriptor.rate_limit {
            llm.rate_limit = Some(rate_limit.clone());
        }
        let model = descriptor.model.as_deref().unwrap_or(&llm.model);
        let client = LlmClient::for_model(&llm, model)?;
        Ok(Arc::new(Self { descriptor, client }))
    }

    /// Ask the model for a transcription.
    #[instrument(level = "debug", skip_all, fields(provider = %self.descriptor.name, model = %self.client.model()))]
    async fn recognize(&self, image: &OcrImage, options: &OcrOptions) -> Result<OcrRecognition> {
        let bindings = transcription_bindings(image, options);
        let messages = TRANSCRIBE_PROMPT.render_prompt(&bindings)?;
        let response = self
            .client
            .structured_completion::<TranscriptionResponse>(messages)
            .await?;
        Ok(recognition_from_response(
            &self.descriptor.name,
            self.client.model(),
            response,
        ))
    }
}

#[async_trait]
impl OcrProvider for LlmOcrProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn attempt(
        &self,
        image: &OcrImage,
        options: &OcrOptions,
    ) -> Result<OcrRecognition, ProviderFailure> {
        self.recognize(image, options)
            .await
            .map_err(|err| ProviderFailure::backend(&self.descriptor.name, err))
    }
}

/// Template bindings for our prompt. Speed gets cheaper low-detail images.
fn transcription_bindings(image: &OcrImage, options: &OcrOptions) -> JsonObject {
    let detail = match options.priority {
        Priority::Speed => "low",
        Priority::Accuracy => "high",
    };
    let mut bindings = JsonObject::new();
    bindings.insert(
        "image_url".to_owned(),
        Value::String(data_url(&image.mime_type, &image.data)),
    );
    bindings.insert("detail".to_owned(), Value::String(detail.to_owned()));
    bindings.insert(
        "language".to_owned(),
        Value::String(options.language.clone()),
    );
    bindings
}

/// Convert a model response. The model's self-reported confidence is the
/// only signal we have, so we clamp it and keep the uncertain words around.
fn recognition_from_response(
    provider: &str,
    model: &str,
    response: TranscriptionResponse,
) -> OcrRecognition {
    OcrRecognition::new(provider, response.text.trim(), response.confidence).with_metadata(
        json!({
            "engine": "llm",
            "model": model,
            "uncertain_words": response.uncertain_words,
        }),
    )
}
