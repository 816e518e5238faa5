//! LLM-backed content, structure and feedback scoring.

use std::sync::LazyLock;

use crate::{
    config::LlmConfig,
    imaging::clamp_score,
    llm_client::LlmClient,
    prelude::*,
    prompt::{ChatPrompt, bindings_from},
    questions::Question,
};

use super::{
    ContentAssessment, ContentScorer, ExtractedAnswer, Feedback, FeedbackGenerator,
    FeedbackRequest, StructureAssessment, StructureScorer,
};

static CONTENT_PROMPT: LazyLock<ChatPrompt> = LazyLock::new(|| {
    ChatPrompt::from_toml(include_str!("prompts/content.toml"))
        .expect("failed to parse built-in content prompt")
});

static STRUCTURE_PROMPT: LazyLock<ChatPrompt> = LazyLock::new(|| {
    ChatPrompt::from_toml(include_str!("prompts/structure.toml"))
        .expect("failed to parse built-in structure prompt")
});

static FEEDBACK_PROMPT: LazyLock<ChatPrompt> = LazyLock::new(|| {
    ChatPrompt::from_toml(include_str!("prompts/feedback.toml"))
        .expect("failed to parse built-in feedback prompt")
});

/// Bindings for the content and structure prompts.
#[derive(Serialize)]
struct AnswerBindings<'a> {
    question: &'a Question,
    answer: &'a ExtractedAnswer,
}

/// Scores answers by asking an LLM.
pub struct LlmScorer {
    client: LlmClient,
}

impl LlmScorer {
    /// Create a scorer using our LLM config.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: LlmClient::new(config)?,
        })
    }
}

#[async_trait]
impl ContentScorer for LlmScorer {
    #[instrument(level = "debug", skip_all, fields(question = %question.id))]
    async fn score_content(
        &self,
        question: &Question,
        answer: &ExtractedAnswer,
    ) -> Result<ContentAssessment> {
        let bindings = bindings_from(&AnswerBindings { question, answer })?;
        let messages = CONTENT_PROMPT.render_prompt(&bindings)?;
        let mut assessment = self
            .client
            .structured_completion::<ContentAssessment>(messages)
            .await
            .context("Content scoring failed")?;
        assessment.score = clamp_score(assessment.score);
        Ok(assessment)
    }
}

#[async_trait]
impl StructureScorer for LlmScorer {
    #[instrument(level = "debug", skip_all, fields(question = %question.id))]
    async fn score_structure(
        &self,
        question: &Question,
        answer: &ExtractedAnswer,
    ) -> Result<StructureAssessment> {
        let bindings = bindings_from(&AnswerBindings { question, answer })?;
        let messages = STRUCTURE_PROMPT.render_prompt(&bindings)?;
        let mut assessment = self
            .client
            .structured_completion::<StructureAssessment>(messages)
            .await
            .context("Structure scoring failed")?;
        assessment.score = clamp_score(assessment.score);
        Ok(assessment)
    }
}

#[async_trait]
impl FeedbackGenerator for LlmScorer {
    #[instrument(level = "debug", skip_all, fields(question = %request.question.id))]
    async fn generate_feedback(&self, request: &FeedbackRequest<'_>) -> Result<Feedback> {
        let bindings = bindings_from(request)?;
        let messages = FEEDBACK_PROMPT.render_prompt(&bindings)?;
        self.client
            .structured_completion::<Feedback>(messages)
            .await
            .context("Feedback generation failed")
    }
}

#[cfg(test)]
mod tests {
    use crate::scoring::HandwritingAnalysis;

    use super::*;

    fn question(model_answer: Option<&str>) -> Question {
        Question {
            id: "chem-1".to_owned(),
            prompt: "Explain why ice floats.".to_owned(),
            model_answer: model_answer.map(str::to_owned),
            rubric: vec!["hydrogen bonding".to_owned(), "density".to_owned()],
            max_marks: 5,
        }
    }

    fn answer(met_threshold: bool) -> ExtractedAnswer {
        ExtractedAnswer {
            text: "Ice is less dense than water & so it floats.".to_owned(),
            confidence: 0.5,
            met_threshold,
        }
    }

    #[test]
    fn test_content_prompt_renders() {
        let question = question(Some("Ice has an open lattice."));
        let answer = answer(false);
        let bindings = bindings_from(&AnswerBindings {
            question: &question,
            answer: &answer,
        })
        .unwrap();
        let messages = CONTENT_PROMPT.render_prompt(&bindings).unwrap();
        let user = messages[1]["content"].as_str().unwrap();
        assert!(user.contains("- hydrogen bonding"));
        assert!(user.contains("Model answer: Ice has an open lattice."));
        assert!(user.contains("some words may be misread"));
        assert!(user.contains("less dense than water & so"));
    }

    #[test]
    fn test_structure_prompt_renders_without_low_confidence_note() {
        let question = question(None);
        let answer = answer(true);
        let bindings = bindings_from(&AnswerBindings {
            question: &question,
            answer: &answer,
        })
        .unwrap();
        let messages = STRUCTURE_PROMPT.render_prompt(&bindings).unwrap();
        let user = messages[1]["content"].as_str().unwrap();
        assert!(!user.contains("line breaks and punctuation"));
    }

    #[test]
    fn test_feedback_prompt_renders() {
        let question = question(None);
        let answer = answer(true);
        let content = ContentAssessment {
            score: 60.0,
            covered_points: vec!["density".to_owned()],
            missing_points: vec!["hydrogen bonding".to_owned()],
            errors: vec![],
            summary: "Partly correct.".to_owned(),
        };
        let structure = StructureAssessment {
            score: 70.0,
            organization: "Fine.".to_owned(),
            clarity: "Clear.".to_owned(),
            issues: vec![],
        };
        let handwriting = HandwritingAnalysis {
            legibility: 50.0,
            consistency: 50.0,
            neatness: 50.0,
            overall: 50.0,
        };
        let request = FeedbackRequest {
            question: &question,
            answer: &answer,
            content: &content,
            structure: &structure,
            handwriting: &handwriting,
            overall_score: 61.0,
        };
        let bindings = bindings_from(&request).unwrap();
        let messages = FEEDBACK_PROMPT.render_prompt(&bindings).unwrap();
        let user = messages[1]["content"].as_str().unwrap();
        assert!(user.contains("Missing: hydrogen bonding;"));
        assert!(user.contains("Overall score: 61.0/100."));
    }
}
