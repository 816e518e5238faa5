use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Config, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod imaging;
mod llm_client;
mod ocr;
mod pipeline;
mod prelude;
mod prompt;
mod questions;
mod rate_limit;
mod retry;
mod scoring;
mod storage;
mod ui;

/// Evaluate photographed handwritten exam answers.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL.
  - OPENAI_API_KEY: The OpenAI key to use for scoring, feedback and LLM OCR.
  - GOOGLE_VISION_API_KEY: Key for the Google Vision OCR provider.
  - GOOGLE_VISION_API_BASE (optional): Override the Google Vision URL.

  Standard AWS environment variables and credential files
  are used for Textract.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// A TOML or JSON config file. Defaults are used if omitted.
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Evaluate a single answer image and print the finished job.
    Evaluate(cmd::evaluate::EvaluateOpts),
    /// Evaluate many answers. The input file should have `subject_id`,
    /// `question_id` and `path` fields.
    Batch(cmd::batch::BatchOpts),
    /// Print the record for a job.
    Status(cmd::status::StatusOpts),
    /// Fail orphaned jobs and delete expired images. Run this when no
    /// evaluations are in progress, for example at startup.
    Sweep(cmd::sweep::SweepOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we streaming output to stdout while work is in progress?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            // We print a single record once the job bar has finished.
            Cmd::Evaluate(_) => false,
            Cmd::Batch(opts) => opts.output_path.is_none(),
            Cmd::Status(_) | Cmd::Sweep(_) | Cmd::Schema(_) => true,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Evaluate(evaluate_opts) => {
            let config = Config::load(opts.config.as_deref()).await?;
            cmd::evaluate::cmd_evaluate(ui, &config, evaluate_opts).await?;
        }
        Cmd::Batch(batch_opts) => {
            let config = Config::load(opts.config.as_deref()).await?;
            cmd::batch::cmd_batch(ui, &config, batch_opts).await?;
        }
        Cmd::Status(status_opts) => {
            let config = Config::load(opts.config.as_deref()).await?;
            cmd::status::cmd_status(&config, status_opts).await?;
        }
        Cmd::Sweep(sweep_opts) => {
            let config = Config::load(opts.config.as_deref()).await?;
            cmd::sweep::cmd_sweep(&config, sweep_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
