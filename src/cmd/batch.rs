//! The `batch` subcommand.

use clap::Args;
use futures::{StreamExt as _, TryStreamExt as _, stream};
use schemars::JsonSchema;

use crate::{
    async_utils::io::{read_jsonl_or_csv, write_output},
    config::Config,
    ocr::Priority,
    pipeline::{EvaluationPipeline, SubmitOptions, SubmitRequest, job::EvaluationJob},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::{StreamOpts, read_upload};

/// Batch command line arguments.
#[derive(Debug, Args)]
pub struct BatchOpts {
    /// JSONL or CSV input, one answer per record. Reads stdin if omitted.
    pub input_path: Option<PathBuf>,

    /// Write JSONL job records here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,
}

/// One answer to evaluate.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BatchInput {
    /// Who wrote the answer.
    pub subject_id: String,

    /// The question being answered.
    pub question_id: String,

    /// Path to the answer image.
    pub path: PathBuf,

    /// Enhance the image even if it looks fine.
    #[serde(default, deserialize_with = "deserialize_flexible_bool")]
    #[schemars(with = "bool")]
    pub enhance_image: bool,

    /// Try this OCR provider first.
    #[serde(default)]
    pub preferred_provider: Option<String>,

    #[serde(default)]
    pub priority: Option<Priority>,

    /// Language of the answer, as an ISO 639-1 code.
    #[serde(default)]
    pub language: Option<String>,
}

/// Accept either a JSON boolean or a CSV-style string.
fn deserialize_flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlexibleBool {
        Bool(bool),
        String(String),
    }

    match FlexibleBool::deserialize(deserializer)? {
        FlexibleBool::Bool(value) => Ok(value),
        FlexibleBool::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, found {other:?}"
            ))),
        },
    }
}

/// The `batch` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_batch(ui: Ui, config: &Config, opts: &BatchOpts) -> Result<()> {
    let pipeline = EvaluationPipeline::from_config(config).await?;

    // Parse everything up front, so a typo on the last line doesn't waste a
    // run.
    let input = read_jsonl_or_csv(opts.input_path.as_deref()).await?;
    let inputs: Vec<BatchInput> = opts
        .stream_opts
        .apply_stream_input_opts(input)
        .and_then(|value| async move {
            serde_json::from_value(value.clone())
                .with_context(|| format!("Invalid batch record: {}", value))
        })
        .try_collect()
        .await?;

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📚",
            msg: "Evaluating answers",
            done_msg: "Evaluated answers",
        },
        inputs.len() as u64,
    );
    let max_upload_bytes = config.pipeline.max_upload_bytes;
    let outputs = stream::iter(inputs)
        .map(move |input| {
            let pipeline = pipeline.clone();
            async move { evaluate_record(&pipeline, input, max_upload_bytes).await }
        })
        .buffered(opts.stream_opts.job_count.max(1));
    let outputs = pb.wrap_stream(outputs).boxed();
    write_output(opts.output_path.as_deref(), outputs).await
}

/// Evaluate one record. Rejections become `{path, error}` records, not
/// errors.
async fn evaluate_record(
    pipeline: &EvaluationPipeline,
    input: BatchInput,
    max_upload_bytes: usize,
) -> Result<Value> {
    let path = input.path.clone();
    match submit_and_wait(pipeline, input, max_upload_bytes).await {
        Ok(job) => serde_json::to_value(job).context("Failed to serialize job"),
        Err(err) => {
            warn!(path = ?path, "Could not evaluate batch record: {:#}", err);
            Ok(json!({
                "path": path,
                "error": format!("{err:#}"),
            }))
        }
    }
}

/// Submit a record and wait for its job to finish.
async fn submit_and_wait(
    pipeline: &EvaluationPipeline,
    input: BatchInput,
    max_upload_bytes: usize,
) -> Result<EvaluationJob> {
    let (filename, image) = read_upload(&input.path, max_upload_bytes).await?;
    let request = SubmitRequest {
        subject_id: input.subject_id,
        question_id: input.question_id,
        filename,
        image,
        options: SubmitOptions {
            preferred_provider: input.preferred_provider,
            enhance_image: input.enhance_image,
            priority: input.priority,
            language: input.language,
        },
    };
    let submission = pipeline.submit(request, None).await?;
    submission.worker.join().await?;
    pipeline
        .get_status(submission.job_id)
        .await?
        .ok_or_else(|| anyhow!("Job {} has no record", submission.job_id))
}
