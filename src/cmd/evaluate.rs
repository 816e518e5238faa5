//! The `evaluate` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::pin_mut;

use crate::{
    config::Config,
    ocr::Priority,
    pipeline::{
        EvaluationPipeline, SubmitOptions, SubmitRequest, Submission,
        job::JobStatus,
        progress::{ProgressEvent, ProgressSink},
    },
    prelude::*,
    ui::{ProgressConfig, Ui, apply_progress_event},
};

use super::{read_upload, write_pretty_json};

/// Evaluate command line arguments.
#[derive(Debug, Args)]
pub struct EvaluateOpts {
    /// A photo or scan of the handwritten answer.
    pub image: PathBuf,

    /// Who wrote the answer.
    #[clap(long)]
    pub subject: String,

    /// The question being answered, from the question bank.
    #[clap(long)]
    pub question: String,

    /// Enhance the image even if it looks fine.
    #[clap(long)]
    pub enhance: bool,

    /// Try this OCR provider first.
    #[clap(long = "provider", value_name = "NAME")]
    pub preferred_provider: Option<String>,

    /// Favor OCR speed or accuracy.
    #[clap(long, value_enum)]
    pub priority: Option<Priority>,

    /// Language of the answer, as an ISO 639-1 code.
    #[clap(long)]
    pub language: Option<String>,

    /// Write the finished job here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `evaluate` subcommand.
#[instrument(level = "debug", skip_all, fields(image = ?opts.image))]
pub async fn cmd_evaluate(ui: Ui, config: &Config, opts: &EvaluateOpts) -> Result<()> {
    let pipeline = EvaluationPipeline::from_config(config).await?;
    let (filename, image) = read_upload(&opts.image, config.pipeline.max_upload_bytes).await?;
    let request = SubmitRequest {
        subject_id: opts.subject.clone(),
        question_id: opts.question.clone(),
        filename,
        image,
        options: SubmitOptions {
            preferred_provider: opts.preferred_provider.clone(),
            enhance_image: opts.enhance,
            priority: opts.priority,
            language: opts.language.clone(),
        },
    };

    let pb = ui.new_job_bar(&ProgressConfig {
        emoji: "📝",
        msg: "Evaluating",
        done_msg: "Evaluated",
    });
    let bar = pb.clone();
    let sink: Arc<dyn ProgressSink> =
        Arc::new(move |event: ProgressEvent| apply_progress_event(&bar, &event));
    let Submission { job_id, worker } = pipeline.submit(request, Some(sink)).await?;
    info!(job = %job_id, "Submitted evaluation");

    // Ctrl-C asks the job to stop at its next stage boundary, and we wait
    // for it to record that.
    let join = worker.join();
    pin_mut!(join);
    tokio::select! {
        result = &mut join => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job = %job_id, "Interrupted, cancelling evaluation");
            pipeline.cancel(job_id);
            join.await?;
        }
    }
    drop(pb);

    let job = pipeline
        .get_status(job_id)
        .await?
        .ok_or_else(|| anyhow!("Job {} has no record", job_id))?;
    write_pretty_json(opts.output_path.as_deref(), &job).await?;
    match job.status {
        JobStatus::Completed => Ok(()),
        status => Err(anyhow!(
            "Job {} ended with status {:?}: {}",
            job_id,
            status,
            job.error_message.as_deref().unwrap_or("no error recorded")
        )),
    }
}
