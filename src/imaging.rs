//! Image quality assessment and enhancement.
//!
//! Everything here is local and CPU-bound, so the async entry points push the
//! real work onto Tokio's blocking pool.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use schemars::JsonSchema;
use tokio::task::spawn_blocking;

use crate::prelude::*;

/// A resolution we consider "good enough" for handwriting (about 2 MP).
const REFERENCE_PIXELS: f64 = 1600.0 * 1200.0;

/// Quality metrics for an image, all on a 0 to 100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImageQuality {
    /// Weighted overall quality.
    pub quality_score: f64,
    /// Edge strength, from the variance of the Laplacian.
    pub sharpness: f64,
    /// Spread of brightness values.
    pub contrast: f64,
    /// How close average brightness is to that of a well-lit page.
    pub exposure: f64,
    /// Pixel count relative to our reference resolution.
    pub resolution: f64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// An enhanced image.
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    /// Encoded image data.
    pub data: Vec<u8>,
    /// MIME type of `data`.
    pub mime_type: String,
}

/// Image quality scoring and enhancement.
#[async_trait]
pub trait ImageProcessor: Send + Sync + 'static {
    /// Measure the quality of an encoded image.
    async fn assess(&self, image: &[u8]) -> Result<ImageQuality>;

    /// Produce an easier-to-read version of an encoded image.
    async fn enhance(&self, image: &[u8]) -> Result<EnhancedImage>;
}

/// An [`ImageProcessor`] built on the `image` crate.
#[derive(Debug, Default)]
pub struct LocalImageProcessor;

#[async_trait]
impl ImageProcessor for LocalImageProcessor {
    #[instrument(level = "debug", skip_all, fields(bytes = image.len()))]
    async fn assess(&self, image: &[u8]) -> Result<ImageQuality> {
        let image = image.to_vec();
        spawn_blocking(move || {
            let gray = decode(&image)?.to_luma8();
            Ok(measure_quality(&gray))
        })
        .await
        .context("image assessment task panicked")?
    }

    #[instrument(level = "debug", skip_all, fields(bytes = image.len()))]
    async fn enhance(&self, image: &[u8]) -> Result<EnhancedImage> {
        let image = image.to_vec();
        spawn_blocking(move || {
            let gray = decode(&image)?.to_luma8();
            let enhanced = enhance_gray(&gray);
            let mut data = Cursor::new(Vec::new());
            DynamicImage::ImageLuma8(enhanced)
                .write_to(&mut data, ImageFormat::Png)
                .context("failed to encode enhanced image")?;
            Ok(EnhancedImage {
                data: data.into_inner(),
                mime_type: "image/png".to_owned(),
            })
        })
        .await
        .context("image enhancement task panicked")?
    }
}

/// Decode an image in any supported format.
fn decode(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).context("failed to decode image")
}

/// Compute quality metrics for a grayscale image.
pub fn measure_quality(gray: &GrayImage) -> ImageQuality {
    let (width, height) = gray.dimensions();
    let pixel_count = f64::from(width) * f64::from(height);
    if pixel_count == 0.0 {
        return ImageQuality {
            quality_score: 0.0,
            sharpness: 0.0,
            contrast: 0.0,
            exposure: 0.0,
            resolution: 0.0,
            width,
            height,
        };
    }

    let (mean, variance) = mean_and_variance(gray.pixels().map(|p| f64::from(p[0])));
    let laplacian_variance = laplacian_variance(gray);

    let sharpness = 100.0 * laplacian_variance / (laplacian_variance + 100.0);
    let contrast = clamp_score(variance.sqrt() / 80.0 * 100.0);
    let exposure = clamp_score(100.0 * (1.0 - (mean / 255.0 - 0.55).abs() / 0.55));
    let resolution = clamp_score((pixel_count / REFERENCE_PIXELS).min(1.0) * 100.0);
    let quality_score = clamp_score(
        0.35 * sharpness + 0.25 * contrast + 0.2 * exposure + 0.2 * resolution,
    );

    ImageQuality {
        quality_score,
        sharpness,
        contrast,
        exposure,
        resolution,
        width,
        height,
    }
}

/// Clamp a score to `0.0..=100.0`, mapping NaN to 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

/// Mean and population variance of some values.
fn mean_and_variance(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut count = 0.0;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values {
        count += 1.0;
        sum += v;
        sum_sq += v * v;
    }
    if count == 0.0 {
        return (0.0, 0.0);
    }
    let mean = sum / count;
    (mean, (sum_sq / count - mean * mean).max(0.0))
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| f64::from(gray.get_pixel(x, y)[0]);
    let responses = (1..height - 1).flat_map(|y| {
        (1..width - 1).map(move |x| {
            4.0 * at(x, y) - at(x - 1, y) - at(x + 1, y) - at(x, y - 1) - at(x, y + 1)
        })
    });
    mean_and_variance(responses).1
}

/// Stretch contrast between the 2nd and 98th percentiles, then sharpen.
fn enhance_gray(gray: &GrayImage) -> GrayImage {
    let mut histogram = [0u64; 256];
    for p in gray.pixels() {
        histogram[usize::from(p[0])] += 1;
    }
    let total = u64::from(gray.width()) * u64::from(gray.height());
    let percentile = |fraction: f64| -> u8 {
        let target = (total as f64 * fraction) as u64;
        let mut seen = 0;
        for (value, count) in histogram.iter().enumerate() {
            seen += count;
            if seen > target {
                return value as u8;
            }
        }
        255
    };
    let low = f64::from(percentile(0.02));
    let high = f64::from(percentile(0.98));

    let stretched = if high - low < 1.0 {
        gray.clone()
    } else {
        let scale = 255.0 / (high - low);
        GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            let v = f64::from(gray.get_pixel(x, y)[0]);
            Luma([((v - low) * scale).clamp(0.0, 255.0).round() as u8])
        })
    };
    image::imageops::unsharpen(&stretched, 1.0, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(gray: GrayImage) -> Vec<u8> {
        let mut data = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut data, ImageFormat::Png)
            .unwrap();
        data.into_inner()
    }

    /// A black-on-white grid of "strokes" at a decent resolution.
    fn sharp_page() -> GrayImage {
        GrayImage::from_fn(1600, 1200, |x, y| {
            if (x / 4) % 4 == 0 || (y / 6) % 5 == 0 {
                Luma([20])
            } else {
                Luma([235])
            }
        })
    }

    #[test]
    fn test_flat_image_scores_poorly() {
        let flat = GrayImage::from_pixel(200, 150, Luma([128]));
        let quality = measure_quality(&flat);
        assert_eq!(quality.sharpness, 0.0);
        assert_eq!(quality.contrast, 0.0);
        assert!(quality.quality_score < 70.0);
    }

    #[test]
    fn test_sharp_page_scores_well() {
        let quality = measure_quality(&sharp_page());
        assert!(quality.sharpness > 90.0, "{quality:?}");
        assert!(quality.contrast > 90.0, "{quality:?}");
        assert_eq!(quality.resolution, 100.0);
        for score in [
            quality.quality_score,
            quality.sharpness,
            quality.contrast,
            quality.exposure,
            quality.resolution,
        ] {
            assert!((0.0..=100.0).contains(&score));
        }
    }

    #[test]
    fn test_empty_image() {
        let quality = measure_quality(&GrayImage::new(0, 0));
        assert_eq!(quality.quality_score, 0.0);
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(-3.0), 0.0);
        assert_eq!(clamp_score(130.0), 100.0);
        assert_eq!(clamp_score(42.5), 42.5);
    }

    #[tokio::test]
    async fn test_enhance_improves_contrast() {
        // A washed-out page: grey strokes on light grey paper.
        let faded = GrayImage::from_fn(400, 300, |x, _| {
            if (x / 5) % 3 == 0 { Luma([150]) } else { Luma([190]) }
        });
        let processor = LocalImageProcessor;
        let before = processor.assess(&png(faded.clone())).await.unwrap();
        let enhanced = processor.enhance(&png(faded)).await.unwrap();
        assert_eq!(enhanced.mime_type, "image/png");
        let after = processor.assess(&enhanced.data).await.unwrap();
        assert_eq!((after.width, after.height), (400, 300));
        assert!(after.contrast > before.contrast);
    }

    #[tokio::test]
    async fn test_garbage_is_an_error() {
        let processor = LocalImageProcessor;
        assert!(processor.assess(b"not an image").await.is_err());
        assert!(processor.enhance(b"not an image").await.is_err());
    }
}
