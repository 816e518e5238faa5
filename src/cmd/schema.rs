//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    pipeline::{job::EvaluationJob, progress::ProgressEvent},
    prelude::*,
};

use super::{batch::BatchInput, write_pretty_json};

/// The different schema types we support.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SchemaType {
    /// A job record, as printed by `evaluate`, `batch` and `status`.
    Job,
    /// A progress event.
    Progress,
    /// One `batch` input record.
    BatchInput,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::Job => schema_for!(EvaluationJob),
        SchemaType::Progress => schema_for!(ProgressEvent),
        SchemaType::BatchInput => schema_for!(BatchInput),
    };
    write_pretty_json(schema_opts.output_path.as_deref(), &schema).await
}
