//! OCR using AWS Textract.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_textract::{
    primitives::Blob,
    types::{self, Block, BlockType, Document},
};
use leaky_bucket::RateLimiter;

use crate::{
    ocr::{BoundingBox, OcrImage, OcrOptions, OcrRecognition, ProviderFailure, WordBox},
    prelude::*,
};

use super::{OcrProvider, ProviderDescriptor};

/// Load the user's AWS configuration using standard conventions.
pub async fn load_aws_config() -> Result<aws_config::SdkConfig> {
    Ok(aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await)
}

/// OCR provider wrapping the AWS Textract API.
pub struct TextractProvider {
    /// Our static description.
    descriptor: ProviderDescriptor,

    /// AWS Textract client.
    client: aws_sdk_textract::Client,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: Option<RateLimiter>,
}

impl TextractProvider {
    /// Create a new `textract` provider.
    #[allow(clippy::new_ret_no_self)]
    pub async fn new(descriptor: ProviderDescriptor) -> Result<Arc<dyn OcrProvider>> {
        let config = load_aws_config().await?;
        if config.region().is_none() {
            return Err(anyhow!("no AWS region configured"));
        }
        let client = aws_sdk_textract::Client::new(&config);
        let rate_limiter = descriptor.rate_limit.as_ref().map(|r| r.to_rate_limiter());
        Ok(Arc::new(Self {
            descriptor,
            client,
            rate_limiter,
        }))
    }

    /// Call Textract and convert the response.
    #[instrument(level = "debug", skip_all, fields(provider = %self.descriptor.name))]
    async fn recognize(&self, image: &OcrImage) -> Result<OcrRecognition> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let document = Document::builder()
            .bytes(Blob::new(image.data.clone()))
            .build();
        let response = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(|err| anyhow!("AWS Textract error: {:?}", err))?;
        trace!("Document response: {response:#?}");
        Ok(recognition_from_blocks(
            &self.descriptor.name,
            response.blocks(),
        ))
    }
}

#[async_trait]
impl OcrProvider for TextractProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn attempt(
        &self,
        image: &OcrImage,
        _options: &OcrOptions,
    ) -> Result<OcrRecognition, ProviderFailure> {
        // Textract detects the language itself.
        self.recognize(image)
            .await
            .map_err(|err| ProviderFailure::backend(&self.descriptor.name, err))
    }
}

/// Build a recognition from Textract blocks. Text comes from `LINE` blocks,
/// and confidence is the mean of the `WORD` block confidences. Textract
/// reports confidence as a percentage.
fn recognition_from_blocks(provider: &str, blocks: &[Block]) -> OcrRecognition {
    let mut lines = vec![];
    let mut words = vec![];
    for block in blocks {
        match block.block_type() {
            Some(BlockType::Line) => {
                if let Some(text) = block.text() {
                    lines.push(text);
                }
            }
            Some(BlockType::Word) => {
                let (Some(text), Some(confidence)) = (block.text(), block.confidence())
                else {
                    continue;
                };
                words.push(WordBox {
                    text: text.to_owned(),
                    confidence: confidence / 100.0,
                    bbox: block
                        .geometry()
                        .and_then(|geometry| geometry.bounding_box())
                        .map(bbox_from_textract),
                });
            }
            _ => {}
        }
    }
    let confidence = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
    };
    OcrRecognition::new(provider, lines.join("\n"), confidence)
        .with_words(words)
        .with_metadata(json!({ "engine": "textract", "line_count": lines.len() }))
}

/// Textract boxes are already fractions of the page.
fn bbox_from_textract(bbox: &types::BoundingBox) -> BoundingBox {
    BoundingBox {
        left: bbox.left(),
        top: bbox.top(),
        width: bbox.width(),
        height: bbox.height(),
    }
}
