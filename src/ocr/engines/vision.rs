//! OCR using the Google Cloud Vision REST API.
//!
//! We use `DOCUMENT_TEXT_DETECTION`, which is tuned for dense text and
//! handwriting, and which reports per-word confidences on a 0 to 1 scale.

use std::{env, sync::Arc};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use leaky_bucket::RateLimiter;

use crate::{
    ocr::{BoundingBox, OcrImage, OcrOptions, OcrRecognition, ProviderFailure, WordBox},
    prelude::*,
};

use super::{OcrProvider, ProviderDescriptor};

/// The default API endpoint.
const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

/// OCR provider wrapping Google Cloud Vision.
pub struct GoogleVisionProvider {
    /// Our static description.
    descriptor: ProviderDescriptor,

    /// Our HTTP client.
    client: reqwest::Client,

    /// The endpoint to call.
    endpoint: String,

    /// Our API key.
    api_key: String,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: Option<RateLimiter>,
}

impl GoogleVisionProvider {
    /// Create a new Google Vision provider. Requires `GOOGLE_VISION_API_KEY`.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(descriptor: ProviderDescriptor) -> Result<Arc<dyn OcrProvider>> {
        let api_key = env::var("GOOGLE_VISION_API_KEY")
            .context("GOOGLE_VISION_API_KEY is not set")?;
        let endpoint = env::var("GOOGLE_VISION_API_BASE")
            .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_owned());
        Ok(Arc::new(Self::with_endpoint(descriptor, endpoint, api_key)))
    }

    /// Create a provider for a specific endpoint and key.
    fn with_endpoint(descriptor: ProviderDescriptor, endpoint: String, api_key: String) -> Self {
        let rate_limiter = descriptor.rate_limit.as_ref().map(|r| r.to_rate_limiter());
        Self {
            descriptor,
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            rate_limiter,
        }
    }

    /// Call the API and convert the response.
    #[instrument(level = "debug", skip_all, fields(provider = %self.descriptor.name))]
    async fn recognize(&self, image: &OcrImage, options: &OcrOptions) -> Result<OcrRecognition> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let request = json!({
            "requests": [{
                "image": { "content": BASE64_STANDARD.encode(&image.data) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "imageContext": { "languageHints": [options.language] },
            }],
        });
        // Failure text is persisted in job records. The key must never
        // appear in a URL.
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Google Vision request failed")?
            .error_for_status()
            .map_err(reqwest::Error::without_url)
            .context("Google Vision returned an error status")?
            .json::<AnnotateResponse>()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse Google Vision response")?;
        recognition_from_response(&self.descriptor.name, response)
    }
}

#[async_trait]
impl OcrProvider for GoogleVisionProvider {
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

/// Top-level response from `images:annotate`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

/// Response for a single image.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

/// An error for a single image.
#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    blocks: Vec<TextBlock>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Word {
    #[serde(default)]
    symbols: Vec<Symbol>,
    confidence: Option<f32>,
    bounding_box: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundingPoly {
    #[serde(default)]
    normalized_vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

impl BoundingPoly {
    /// Convert normalized vertices to a box, if we have any.
    fn to_bbox(&self) -> Option<BoundingBox> {
        let vertices = &self.normalized_vertices;
        if vertices.is_empty() {
            return None;
        }
        let fold = |init: f32, f: fn(f32, f32) -> f32, get: fn(&Vertex) -> f32| {
            vertices.iter().map(get).fold(init, f)
        };
        let left = fold(f32::MAX, f32::min, |v| v.x);
        let right = fold(f32::MIN, f32::max, |v| v.x);
        let top = fold(f32::MAX, f32::min, |v| v.y);
        let bottom = fold(f32::MIN, f32::max, |v| v.y);
        Some(BoundingBox {
            left,
            top,
            width: right - left,
            height: bottom - top,
        })
    }
}

/// Convert an API response to a recognition.
fn recognition_from_response(
    provider: &str,
    response: AnnotateResponse,
) -> Result<OcrRecognition> {
    let image_response = response
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Google Vision returned no responses"))?;
    if let Some(status) = image_response.error {
        return Err(anyhow!(
            "Google Vision error {}: {}",
            status.code,
            status.message
        ));
    }
    let Some(annotation) = image_response.full_text_annotation else {
        // No text found at all.
        return Ok(OcrRecognition::new(provider, "", 0.0));
    };

    let mut words = vec![];
    let mut page_confidences = vec![];
    for page in &annotation.pages {
        page_confidences.extend(page.confidence);
        for paragraph in page.blocks.iter().flat_map(|b| &b.paragraphs) {
            for word in &paragraph.words {
                let text = word.symbols.iter().map(|s| s.text.as_str()).collect::<String>();
                if text.is_empty() {
                    continue;
                }
                words.push(WordBox {
                    text,
                    confidence: word.confidence.unwrap_or(0.0),
                    bbox: word.bounding_box.as_ref().and_then(BoundingPoly::to_bbox),
                });
            }
        }
    }

    let mean = |values: &[f32]| values.iter().sum::<f32>() / values.len() as f32;
    let confidence = if !words.is_empty() {
        mean(&words.iter().map(|w| w.confidence).collect::<Vec<_>>())
    } else if !page_confidences.is_empty() {
        mean(&page_confidences)
    } else {
        0.0
    };
    Ok(OcrRecognition::new(provider, annotation.text.trim_end(), confidence)
        .with_words(words)
        .with_metadata(json!({ "engine": "google_vision" })))
}
