//! The persisted record of an evaluation job.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    imaging::ImageQuality,
    prelude::*,
    scoring::{
        ContentAssessment, FeedbackSource, HandwritingAnalysis, StructureAssessment,
    },
};

/// A job identifier (a random UUID).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a new, random job ID.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s).with_context(|| format!("invalid job ID {:?}", s))?;
        Ok(Self(uuid))
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Will this job never change again?
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Uploading,
    AssessingImage,
    EnhancingImage,
    ExtractingText,
    AnalyzingContent,
    AnalyzingStructure,
    AnalyzingHandwriting,
    GeneratingFeedback,
    Persisting,
    Completed,
}

impl Stage {
    /// Progress percentage reported when we enter this stage.
    pub fn percent(self) -> u8 {
        match self {
            Stage::Created => 0,
            Stage::Uploading => 5,
            Stage::AssessingImage => 15,
            Stage::EnhancingImage => 25,
            Stage::ExtractingText => 35,
            Stage::AnalyzingContent => 50,
            Stage::AnalyzingStructure => 60,
            Stage::AnalyzingHandwriting => 70,
            Stage::GeneratingFeedback => 80,
            Stage::Persisting => 90,
            Stage::Completed => 100,
        }
    }

    /// A human-readable description of this stage.
    pub fn description(self) -> &'static str {
        match self {
            Stage::Created => "Job created",
            Stage::Uploading => "Uploading image",
            Stage::AssessingImage => "Assessing image quality",
            Stage::EnhancingImage => "Enhancing image",
            Stage::ExtractingText => "Extracting text",
            Stage::AnalyzingContent => "Analyzing content",
            Stage::AnalyzingStructure => "Analyzing structure",
            Stage::AnalyzingHandwriting => "Analyzing handwriting",
            Stage::GeneratingFeedback => "Generating feedback",
            Stage::Persisting => "Saving results",
            Stage::Completed => "Evaluation complete",
        }
    }
}

/// One submitted answer evaluation. Fields are filled in as stages complete,
/// so a job which failed part way through still shows what we learned.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct EvaluationJob {
    pub id: JobId,
    pub subject_id: String,
    pub question_id: String,
    pub filename: String,
    pub status: JobStatus,

    /// The last stage we checkpointed.
    pub stage: Stage,

    #[serde(default)]
    pub original_image_url: Option<String>,
    #[serde(default)]
    pub enhanced_image_url: Option<String>,
    #[serde(default)]
    pub image_quality: Option<ImageQuality>,

    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub ocr_provider: Option<String>,
    #[serde(default)]
    pub ocr_confidence: Option<f32>,
    /// Which providers were tried, and why the losers lost.
    #[serde(default)]
    pub ocr_metadata: Option<Value>,

    #[serde(default)]
    pub content_assessment: Option<ContentAssessment>,
    #[serde(default)]
    pub structure_assessment: Option<StructureAssessment>,
    #[serde(default)]
    pub handwriting_analysis: Option<HandwritingAnalysis>,

    /// Scores from 0 to 100.
    #[serde(default)]
    pub content_score: Option<f64>,
    #[serde(default)]
    pub structure_score: Option<f64>,
    #[serde(default)]
    pub handwriting_score: Option<f64>,
    #[serde(default)]
    pub overall_score: Option<f64>,

    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub detailed_feedback: Option<String>,
    #[serde(default)]
    pub feedback_source: Option<FeedbackSource>,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_duration_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationJob {
    /// A fresh job in the `Created` stage.
    pub fn new(
        subject_id: impl Into<String>,
        question_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            subject_id: subject_id.into(),
            question_id: question_id.into(),
            filename: filename.into(),
            status: JobStatus::Processing,
            stage: Stage::Created,
            original_image_url: None,
            enhanced_image_url: None,
            image_quality: None,
            extracted_text: None,
            ocr_provider: None,
            ocr_confidence: None,
            ocr_metadata: None,
            content_assessment: None,
            structure_assessment: None,
            handwriting_analysis: None,
            content_score: None,
            structure_score: None,
            handwriting_score: None,
            overall_score: None,
            strengths: vec![],
            improvements: vec![],
            suggestions: vec![],
            detailed_feedback: None,
            feedback_source: None,
            error_message: None,
            processing_duration_ms: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Blob URLs owned by this job.
    pub fn blob_urls(&self) -> Vec<String> {
        self.original_image_url
            .iter()
            .chain(self.enhanced_image_url.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_round_trip() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
        assert_eq!(serde_json::to_value(id).unwrap(), json!(id.to_string()));
    }

    #[test]
    fn test_stage_percentages_increase() {
        let stages = [
            Stage::Created,
            Stage::Uploading,
            Stage::AssessingImage,
            Stage::EnhancingImage,
            Stage::ExtractingText,
            Stage::AnalyzingContent,
            Stage::AnalyzingStructure,
            Stage::AnalyzingHandwriting,
            Stage::GeneratingFeedback,
            Stage::Persisting,
            Stage::Completed,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].percent() < pair[1].percent());
        }
        assert_eq!(Stage::Completed.percent(), 100);
    }

    #[test]
    fn test_serialized_field_names() {
        let job = EvaluationJob::new("s", "q", "a.png");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["stage"], "created");
        assert!(value.get("overall_score").is_some());
        assert!(!job.status.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
