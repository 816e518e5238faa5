//! Scoring an extracted answer: content, structure, handwriting and feedback.
//!
//! Content, structure and feedback are judged by external collaborators
//! (normally an LLM, see [`llm::LlmScorer`]). Handwriting is computed locally
//! from OCR and image metrics. When feedback generation fails we fall back to
//! [`feedback::fallback_feedback`].

use schemars::JsonSchema;

use crate::{imaging::clamp_score, prelude::*, questions::Question};

pub mod feedback;
pub mod handwriting;
pub mod llm;

pub use handwriting::{HandwritingAnalysis, analyze_handwriting};

/// Weights used to combine component scores into an overall score.
pub const CONTENT_WEIGHT: f64 = 0.5;
pub const STRUCTURE_WEIGHT: f64 = 0.3;
pub const HANDWRITING_WEIGHT: f64 = 0.2;

/// Text extracted from an answer, plus how far we trust it.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedAnswer {
    /// The text, as recognized by OCR.
    pub text: String,

    /// OCR confidence, from 0 to 1.
    pub confidence: f32,

    /// Did OCR meet our confidence threshold? If not, scorers should allow
    /// for recognition mistakes.
    pub met_threshold: bool,
}

/// How well an answer covers the expected content.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ContentAssessment {
    /// Score from 0 to 100.
    pub score: f64,

    /// Rubric points the answer covers.
    pub covered_points: Vec<String>,

    /// Rubric points the answer misses.
    pub missing_points: Vec<String>,

    /// Factual or conceptual errors in the answer.
    pub errors: Vec<String>,

    /// A one or two sentence summary of the assessment.
    pub summary: String,
}

/// How well an answer is organized.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StructureAssessment {
    /// Score from 0 to 100.
    pub score: f64,

    /// Comments on the order and flow of the answer.
    pub organization: String,

    /// Comments on how clearly the answer is expressed.
    pub clarity: String,

    /// Specific structural problems.
    pub issues: Vec<String>,
}

/// Feedback for the student.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Feedback {
    /// What the student did well.
    pub strengths: Vec<String>,

    /// What the student should work on.
    pub improvements: Vec<String>,

    /// Concrete next steps.
    pub suggestions: Vec<String>,

    /// A paragraph of feedback addressed to the student.
    pub detailed_feedback: String,
}

impl Feedback {
    /// Is this good enough to show a student?
    pub fn is_usable(&self) -> bool {
        !self.detailed_feedback.trim().is_empty()
            && !(self.strengths.is_empty() && self.improvements.is_empty())
    }
}

/// Where our feedback came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// Written by the feedback generator.
    Generated,
    /// Built locally because the generator failed.
    Fallback,
}

/// Everything the feedback generator gets to see.
#[derive(Debug, Serialize)]
pub struct FeedbackRequest<'a> {
    pub question: &'a Question,
    pub answer: &'a ExtractedAnswer,
    pub content: &'a ContentAssessment,
    pub structure: &'a StructureAssessment,
    pub handwriting: &'a HandwritingAnalysis,
    pub overall_score: f64,
}

/// Judges answer content.
#[async_trait]
pub trait ContentScorer: Send + Sync + 'static {
    /// Assess the content of `answer`.
    async fn score_content(
        &self,
        question: &Question,
        answer: &ExtractedAnswer,
    ) -> Result<ContentAssessment>;
}

/// Judges answer structure.
#[async_trait]
pub trait StructureScorer: Send + Sync + 'static {
    /// Assess the structure of `answer`.
    async fn score_structure(
        &self,
        question: &Question,
        answer: &ExtractedAnswer,
    ) -> Result<StructureAssessment>;
}

/// Writes feedback for the student.
#[async_trait]
pub trait FeedbackGenerator: Send + Sync + 'static {
    /// Generate feedback from all our earlier results.
    async fn generate_feedback(&self, request: &FeedbackRequest<'_>) -> Result<Feedback>;
}

/// Combine component scores into an overall score.
pub fn overall_score(content: f64, structure: f64, handwriting: f64) -> f64 {
    clamp_score(
        CONTENT_WEIGHT * clamp_score(content)
            + STRUCTURE_WEIGHT * clamp_score(structure)
            + HANDWRITING_WEIGHT * clamp_score(handwriting),
    )
}
