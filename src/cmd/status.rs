//! The `status` subcommand.

use clap::Args;

use crate::{
    config::Config,
    pipeline::job::JobId,
    prelude::*,
    storage::{JobStore as _, Storage},
};

use super::write_pretty_json;

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The job to look up.
    #[clap(value_name = "JOB_ID")]
    pub job_id: JobId,

    /// Write the job record here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all, fields(job = %opts.job_id))]
pub async fn cmd_status(config: &Config, opts: &StatusOpts) -> Result<()> {
    let storage = Storage::open(&config.data_dir).await?;
    let job = storage
        .jobs
        .get(opts.job_id)
        .await
        .with_context(|| format!("Failed to read job {}", opts.job_id))?
        .ok_or_else(|| anyhow!("No such job: {}", opts.job_id))?;
    write_pretty_json(opts.output_path.as_deref(), &job).await
}
