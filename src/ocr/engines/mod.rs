//! OCR provider interface, and the registry of configured providers.

use std::{collections::HashSet, sync::Arc};

use crate::{
    config::{LlmConfig, OcrConfig},
    prelude::*,
    rate_limit::RateLimit,
};

use super::{OcrImage, OcrOptions, OcrRecognition, ProviderFailure};

pub mod llm;
pub mod tesseract;
pub mod textract;
pub mod vision;

/// The kinds of OCR backend we know how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// AWS Textract.
    Textract,
    /// Google Cloud Vision.
    GoogleVision,
    /// A vision-capable LLM behind an OpenAI-compatible API.
    Llm,
    /// The local `tesseract` CLI.
    Tesseract,
}

/// Static description of a provider, loaded from config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderDescriptor {
    /// Unique name, used for `preferred_provider` and in job records.
    pub name: String,

    /// Which backend to use.
    pub kind: ProviderKind,

    /// ISO 639-1 codes this provider handles. Empty means "anything".
    #[serde(default)]
    pub supported_languages: Vec<String>,

    /// The largest image this provider accepts.
    #[serde(default)]
    pub max_payload_bytes: Option<usize>,

    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i32,

    /// An optional outbound rate limit, like `"10/s"`.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,

    /// Model name, for LLM providers.
    #[serde(default)]
    pub model: Option<String>,
}

impl ProviderDescriptor {
    /// If this provider can't handle a request, explain why.
    pub fn unsupported_reason(&self, language: &str, payload_len: usize) -> Option<String> {
        if !self.supports_language(language) {
            return Some(format!("language {:?} not supported", language));
        }
        match self.max_payload_bytes {
            Some(max) if payload_len > max => Some(format!(
                "image is {} bytes, limit is {}",
                payload_len, max
            )),
            _ => None,
        }
    }

    /// Do we support `language`? `"en-GB"` matches `"en"`.
    fn supports_language(&self, language: &str) -> bool {
        if self.supported_languages.is_empty() {
            return true;
        }
        let primary = |tag: &str| {
            tag.split(['-', '_'])
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase()
        };
        let wanted = primary(language);
        self.supported_languages
            .iter()
            .any(|supported| primary(supported) == wanted)
    }

    /// A plain descriptor for tests.
    #[cfg(test)]
    pub fn for_tests(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: ProviderKind::Tesseract,
            supported_languages: vec![],
            max_payload_bytes: None,
            priority: 0,
            rate_limit: None,
            model: None,
        }
    }
}

/// A single OCR backend.
///
/// Implementations must convert their native confidence scale to `0.0..=1.0`,
/// and must report every error as a [`ProviderFailure`].
#[async_trait]
pub trait OcrProvider: Send + Sync + 'static {
    /// Our static description.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Make one recognition attempt.
    async fn attempt(
        &self,
        image: &OcrImage,
        options: &OcrOptions,
    ) -> Result<OcrRecognition, ProviderFailure>;
}

/// Our configured providers, in default trial order.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn OcrProvider>>,
}

impl ProviderRegistry {
    /// Build all the providers in our config. Providers which can't be built
    /// (usually because of missing credentials) are skipped with a warning.
    #[instrument(level = "debug", skip_all)]
    pub async fn from_config(ocr: &OcrConfig, llm: &LlmConfig) -> Result<Self> {
        let mut providers = vec![];
        for descriptor in &ocr.providers {
            match create_provider(descriptor.clone(), llm).await {
                Ok(provider) => providers.push(provider),
                Err(err) => warn!(
                    provider = %descriptor.name,
                    "Skipping OCR provider: {:#}",
                    err
                ),
            }
        }
        if providers.is_empty() {
            return Err(anyhow!("No OCR providers could be configured"));
        }
        Self::new(providers)
    }

    /// Build a registry from existing providers, sorted by priority. Ties keep
    /// their original order.
    pub fn new(mut providers: Vec<Arc<dyn OcrProvider>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for provider in &providers {
            let name = &provider.descriptor().name;
            if !seen.insert(name.clone()) {
                return Err(anyhow!("Duplicate OCR provider name {:?}", name));
            }
        }
        providers.sort_by_key(|p| p.descriptor().priority);
        info!(
            providers = ?providers.iter().map(|p| &p.descriptor().name).collect::<Vec<_>>(),
            "OCR providers ready"
        );
        Ok(Self { providers })
    }

    /// Our providers, in default trial order.
    pub fn providers(&self) -> &[Arc<dyn OcrProvider>] {
        &self.providers
    }
}

/// Create the provider for a descriptor.
async fn create_provider(
    descriptor: ProviderDescriptor,
    llm: &LlmConfig,
) -> Result<Arc<dyn OcrProvider>> {
    match descriptor.kind {
        ProviderKind::Textract => textract::TextractProvider::new(descriptor).await,
        ProviderKind::GoogleVision => vision::GoogleVisionProvider::new(descriptor),
        ProviderKind::Llm => llm::LlmOcrProvider::new(descriptor, llm),
        ProviderKind::Tesseract => tesseract::TesseractProvider::new(descriptor).await,
    }
}
