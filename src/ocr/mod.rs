//! Text extraction using several unreliable OCR providers.
//!
//! The [`OcrOrchestrator`] tries providers one at a time, giving each a fixed
//! time budget. The first result which is confident enough wins. If nobody is
//! confident enough, we settle for the most confident result we saw.

use std::{fmt, sync::Arc, time::Duration};

use clap::ValueEnum;
use schemars::JsonSchema;
use tokio::time;

use crate::{config::OcrConfig, prelude::*};

use self::engines::{OcrProvider, ProviderRegistry};

pub mod engines;

/// Should OCR favor speed or accuracy?
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Prefer fast, cheap recognition.
    Speed,
    /// Prefer the best transcription we can get.
    #[default]
    Accuracy,
}

/// An encoded image to recognize.
#[derive(Debug, Clone)]
pub struct OcrImage {
    /// The encoded image.
    pub data: Vec<u8>,
    /// The MIME type of `data`.
    pub mime_type: String,
}

impl OcrImage {
    /// Create a new image.
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    /// A file extension matching our MIME type.
    pub fn extension(&self) -> Result<&'static str> {
        mime_guess::get_mime_extensions_str(&self.mime_type)
            .and_then(|exts| exts.first().copied())
            .ok_or_else(|| anyhow!("cannot determine extension for {}", self.mime_type))
    }
}

/// Per-request OCR options.
#[derive(Debug, Clone)]
pub struct OcrOptions {
    /// Try this provider first, if we know it.
    pub preferred_provider: Option<String>,
    /// The language of the text, as an ISO 639-1 code like `"en"`.
    pub language: String,
    /// Speed or accuracy?
    pub priority: Priority,
}

/// A bounding box, in fractions of the page size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// A recognized word.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordBox {
    /// The word.
    pub text: String,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
    /// Where the word is, if the provider told us.
    pub bbox: Option<BoundingBox>,
}

/// One provider's successful recognition.
#[derive(Debug, Clone)]
pub struct OcrRecognition {
    /// The provider that produced this.
    pub provider: String,
    /// The recognized text.
    pub text: String,
    /// Overall confidence, always in `0.0..=1.0`.
    pub confidence: f32,
    /// Per-word results, if available.
    pub words: Vec<WordBox>,
    /// Provider-specific details.
    pub metadata: Value,
}

impl OcrRecognition {
    /// Create a new recognition. `confidence` must already be on a 0 to 1
    /// scale; out-of-range values are clamped.
    pub fn new(provider: impl Into<String>, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            provider: provider.into(),
            text: text.into(),
            confidence: normalize_confidence(confidence),
            words: vec![],
            metadata: Value::Null,
        }
    }

    /// Attach per-word results.
    pub fn with_words(mut self, words: Vec<WordBox>) -> Self {
        self.words = words;
        self
    }

    /// Attach provider-specific metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Clamp a confidence to `0.0..=1.0`, mapping NaN to 0.
pub fn normalize_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Why a single provider failed.
#[derive(Debug)]
pub enum FailureKind {
    /// The provider didn't answer in time.
    TimedOut(Duration),
    /// The provider can't handle this request, so we didn't ask.
    Unsupported(String),
    /// The provider returned an error.
    Backend(anyhow::Error),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::TimedOut(timeout) => write!(f, "timed out after {:?}", timeout),
            FailureKind::Unsupported(reason) => write!(f, "unsupported: {}", reason),
            FailureKind::Backend(err) => write!(f, "{:#}", err),
        }
    }
}

/// A typed failure from a single provider.
#[derive(Debug, thiserror::Error)]
#[error("{provider}: {kind}")]
pub struct ProviderFailure {
    /// The provider that failed.
    pub provider: String,
    /// What went wrong.
    pub kind: FailureKind,
}

impl ProviderFailure {
    /// The provider returned an error.
    pub fn backend(provider: impl Into<String>, err: anyhow::Error) -> Self {
        Self {
            provider: provider.into(),
            kind: FailureKind::Backend(err),
        }
    }

    /// The provider ran out of time.
    pub fn timed_out(provider: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider: provider.into(),
            kind: FailureKind::TimedOut(timeout),
        }
    }

    /// The provider can't handle this request.
    pub fn unsupported(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind: FailureKind::Unsupported(reason.into()),
        }
    }
}

/// Every provider failed.
#[derive(Debug, thiserror::Error)]
pub struct OcrExhausted {
    /// Failures, in the order we tried the providers.
    pub failures: Vec<ProviderFailure>,
}

impl fmt::Display for OcrExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "no OCR providers are available");
        }
        write!(f, "all OCR providers failed: ")?;
        for (idx, failure) in self.failures.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

/// The result of a successful [`OcrOrchestrator::extract_text`] call.
#[derive(Debug)]
pub struct OcrOutcome {
    /// The best recognition we found.
    pub recognition: OcrRecognition,
    /// Providers we actually called, in order.
    pub attempted: Vec<String>,
    /// Providers which failed or were skipped, in order.
    pub failures: Vec<ProviderFailure>,
    /// Did `recognition` meet our confidence threshold?
    pub met_threshold: bool,
}

impl OcrOutcome {
    /// A summary suitable for storing with the job.
    pub fn metadata(&self) -> Value {
        json!({
            "attempted": self.attempted,
            "failures": self.failures.iter().map(|f| json!({
                "provider": f.provider,
                "error": f.kind.to_string(),
            })).collect::<Vec<_>>(),
            "met_threshold": self.met_threshold,
            "word_count": self.recognition.words.len(),
            "provider_metadata": self.recognition.metadata,
        })
    }
}

/// Runs providers in order until one is confident enough.
pub struct OcrOrchestrator {
    /// Providers in default trial order.
    providers: Vec<Arc<dyn OcrProvider>>,
    /// Stop as soon as a result reaches this confidence.
    min_confidence: f32,
    /// How long each provider gets.
    attempt_timeout: Duration,
}

impl OcrOrchestrator {
    /// Create an orchestrator using the providers in `registry`.
    pub fn new(registry: &ProviderRegistry, config: &OcrConfig) -> Self {
        Self::from_providers(
            registry.providers().to_vec(),
            config.min_confidence,
            config.attempt_timeout(),
        )
    }

    /// Create an orchestrator from providers already in trial order.
    pub fn from_providers(
        providers: Vec<Arc<dyn OcrProvider>>,
        min_confidence: f32,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            min_confidence,
            attempt_timeout,
        }
    }

    /// The order in which to try our providers.
    fn trial_order(&self, preferred: Option<&str>) -> Vec<Arc<dyn OcrProvider>> {
        let mut order = self.providers.clone();
        if let Some(preferred) = preferred {
            match order.iter().position(|p| p.descriptor().name == preferred) {
                Some(idx) => {
                    let provider = order.remove(idx);
                    order.insert(0, provider);
                }
                None => warn!(preferred, "Unknown preferred OCR provider, ignoring"),
            }
        }
        order
    }

    /// Extract text from `image`.
    ///
    /// Individual provider failures never escape. We only fail if every
    /// provider failed.
    #[instrument(level = "debug", skip_all, fields(bytes = image.data.len(), language = %options.language))]
    pub async fn extract_text(
        &self,
        image: &OcrImage,
        options: &OcrOptions,
    ) -> Result<OcrOutcome, OcrExhausted> {
        let mut attempted = vec![];
        let mut failures = vec![];
        let mut best: Option<OcrRecognition> = None;

        for provider in self.trial_order(options.preferred_provider.as_deref()) {
            let descriptor = provider.descriptor();
            if let Some(reason) =
                descriptor.unsupported_reason(&options.language, image.data.len())
            {
                debug!(provider = %descriptor.name, %reason, "Skipping OCR provider");
                failures.push(ProviderFailure::unsupported(&descriptor.name, reason));
                continue;
            }

            attempted.push(descriptor.name.clone());
            // If we time out, the attempt future is dropped here, so it can
            // never report a late result.
            let result =
                match time::timeout(self.attempt_timeout, provider.attempt(image, options))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderFailure::timed_out(
                        &descriptor.name,
                        self.attempt_timeout,
                    )),
                };

            match result {
                Ok(recognition) => {
                    debug!(
                        provider = %recognition.provider,
                        confidence = recognition.confidence,
                        "OCR provider succeeded"
                    );
                    if recognition.confidence >= self.min_confidence {
                        return Ok(OcrOutcome {
                            recognition,
                            attempted,
                            failures,
                            met_threshold: true,
                        });
                    }
                    // Strictly greater, so ties go to the earliest provider.
                    if best
                        .as_ref()
                        .is_none_or(|b| recognition.confidence > b.confidence)
                    {
                        best = Some(recognition);
                    }
                }
                Err(failure) => {
                    warn!(%failure, "OCR provider failed");
                    failures.push(failure);
                }
            }
        }

        match best {
            Some(recognition) => {
                info!(
                    provider = %recognition.provider,
                    confidence = recognition.confidence,
                    min_confidence = self.min_confidence,
                    "No OCR provider met the confidence threshold; using best result"
                );
                Ok(OcrOutcome {
                    recognition,
                    attempted,
                    failures,
                    met_threshold: false,
                })
            }
            None => Err(OcrExhausted { failures }),
        }
    }
}
