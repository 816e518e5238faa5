//! The questions students are answering.

use std::collections::HashMap;

use schemars::JsonSchema;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// An exam question.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Question {
    /// Unique question ID.
    pub id: String,

    /// The question as shown to students.
    pub prompt: String,

    /// A model answer, if the examiner supplied one.
    #[serde(default)]
    pub model_answer: Option<String>,

    /// Rubric points a good answer should cover.
    #[serde(default)]
    pub rubric: Vec<String>,

    /// Marks available.
    #[serde(default = "default_max_marks")]
    pub max_marks: u32,
}

fn default_max_marks() -> u32 {
    10
}

/// Somewhere we can look up questions.
#[async_trait]
pub trait QuestionSource: Send + Sync + 'static {
    /// Look up a question. Returns `Ok(None)` if there is no such question.
    async fn get_question(&self, question_id: &str) -> Result<Option<Question>>;
}

/// On-disk format of a question bank.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuestionBankFile {
    /// Our questions.
    #[serde(default, rename = "question")]
    questions: Vec<Question>,
}

/// Questions loaded once from a TOML or JSON file:
///
/// ```toml
/// [[question]]
/// id = "chem-1"
/// prompt = "Explain why ice floats."
/// rubric = ["hydrogen bonding", "density"]
/// max_marks = 5
/// ```
#[derive(Debug, Default)]
pub struct QuestionBank {
    questions: HashMap<String, Question>,
}

impl QuestionBank {
    /// Load a question bank from a file.
    pub async fn load(path: &Path) -> Result<Self> {
        let file = read_json_or_toml::<QuestionBankFile>(path).await?;
        Self::from_questions(file.questions)
            .with_context(|| format!("Invalid question bank {:?}", path))
    }

    /// Build a question bank, rejecting duplicate IDs.
    pub fn from_questions(questions: impl IntoIterator<Item = Question>) -> Result<Self> {
        let mut by_id = HashMap::new();
        for question in questions {
            if question.id.trim().is_empty() {
                return Err(anyhow!("Question with empty ID"));
            }
            if let Some(dup) = by_id.insert(question.id.clone(), question) {
                return Err(anyhow!("Duplicate question ID {:?}", dup.id));
            }
        }
        Ok(Self { questions: by_id })
    }

    /// How many questions do we have?
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Do we have no questions at all?
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[async_trait]
impl QuestionSource for QuestionBank {
    async fn get_question(&self, question_id: &str) -> Result<Option<Question>> {
        Ok(self.questions.get(question_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_question_bank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("questions.toml");
        tokio::fs::write(
            &path,
            r#"
[[question]]
id = "chem-1"
prompt = "Explain why ice floats."
rubric = ["hydrogen bonding", "density"]
max_marks = 5

[[question]]
id = "hist-2"
prompt = "What caused the First World War?"
"#,
        )
        .await
        .unwrap();

        let bank = QuestionBank::load(&path).await.unwrap();
        assert_eq!(bank.len(), 2);
        let chem = bank.get_question("chem-1").await.unwrap().unwrap();
        assert_eq!(chem.rubric.len(), 2);
        assert_eq!(chem.max_marks, 5);
        let hist = bank.get_question("hist-2").await.unwrap().unwrap();
        assert_eq!(hist.max_marks, 10);
        assert!(hist.model_answer.is_none());
        assert!(bank.get_question("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let question = Question {
            id: "q".to_owned(),
            prompt: "?".to_owned(),
            model_answer: None,
            rubric: vec![],
            max_marks: 1,
        };
        assert!(QuestionBank::from_questions([question.clone(), question]).is_err());
    }
}
