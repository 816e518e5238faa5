//! Handwriting analysis, computed from OCR confidence and image quality.

use schemars::JsonSchema;

use crate::{
    imaging::{ImageQuality, clamp_score},
    ocr::WordBox,
    prelude::*,
};

/// Handwriting scores, each from 0 to 100.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct HandwritingAnalysis {
    /// How readable the writing was to OCR.
    pub legibility: f64,

    /// How evenly readable the individual words were.
    pub consistency: f64,

    /// How clean the page looks.
    pub neatness: f64,

    /// Weighted combination of the above.
    pub overall: f64,
}

/// Analyze handwriting. This is a pure function of its inputs.
pub fn analyze_handwriting(
    ocr_confidence: f32,
    words: &[WordBox],
    quality: &ImageQuality,
) -> HandwritingAnalysis {
    let legibility = clamp_score(100.0 * f64::from(ocr_confidence));

    let consistency = if words.len() < 2 {
        legibility
    } else {
        let confidences = words
            .iter()
            .map(|w| f64::from(w.confidence))
            .collect::<Vec<_>>();
        let n = confidences.len() as f64;
        let mean = confidences.iter().sum::<f64>() / n;
        let variance = confidences.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        clamp_score(100.0 * (1.0 - (4.0 * variance).min(1.0)))
    };

    let neatness =
        clamp_score((quality.quality_score + quality.sharpness + quality.contrast) / 3.0);

    let overall = clamp_score(0.5 * legibility + 0.3 * consistency + 0.2 * neatness);
    HandwritingAnalysis {
        legibility,
        consistency,
        neatness,
        overall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality(score: f64) -> ImageQuality {
        ImageQuality {
            quality_score: score,
            sharpness: score,
            contrast: score,
            exposure: score,
            resolution: score,
            width: 100,
            height: 100,
        }
    }

    fn word(confidence: f32) -> WordBox {
        WordBox {
            text: "w".to_owned(),
            confidence,
            bbox: None,
        }
    }

    #[test]
    fn test_uniform_words() {
        let words = vec![word(0.8), word(0.8), word(0.8)];
        let analysis = analyze_handwriting(0.8, &words, &quality(60.0));
        assert!((analysis.legibility - 80.0).abs() < 1e-4);
        assert!((analysis.consistency - 100.0).abs() < 1e-9);
        assert!((analysis.neatness - 60.0).abs() < 1e-9);
        assert!((analysis.overall - (40.0 + 30.0 + 12.0)).abs() < 1e-3);
    }

    #[test]
    fn test_uneven_words() {
        // Confidences 0.5 and 1.0: variance 0.0625, so consistency is 75.
        let words = vec![word(0.5), word(1.0)];
        let analysis = analyze_handwriting(0.75, &words, &quality(100.0));
        assert!((analysis.consistency - 75.0).abs() < 1e-6);
    }

    #[test]
    fn test_few_words_uses_legibility() {
        let analysis = analyze_handwriting(0.5, &[word(0.1)], &quality(0.0));
        assert_eq!(analysis.consistency, analysis.legibility);
        assert_eq!(analysis.neatness, 0.0);
    }

    #[test]
    fn test_is_pure_and_bounded() {
        let words = vec![word(0.0), word(1.0), word(0.0), word(1.0)];
        let q = quality(150.0);
        let first = analyze_handwriting(1.5, &words, &q);
        let second = analyze_handwriting(1.5, &words, &q);
        assert_eq!(first, second);
        for score in [
            first.legibility,
            first.consistency,
            first.neatness,
            first.overall,
        ] {
            assert!((0.0..=100.0).contains(&score));
        }
    }
}
