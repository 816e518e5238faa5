//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::{BoxedStream, io::create_writer},
    prelude::*,
};

pub mod batch;
pub mod evaluate;
pub mod schema;
pub mod status;
pub mod sweep;

/// Common options for subcommands that process data streams.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    take_first: Option<usize>,

    /// Max number of evaluations to run at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,
}

impl StreamOpts {
    /// Apply any necessary stream opts to our input stream.
    pub fn apply_stream_input_opts<T>(
        &self,
        input: BoxedStream<Result<T>>,
    ) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        if let Some(take_first) = self.take_first {
            input.take(take_first).boxed()
        } else {
            input
        }
    }
}

/// Write `value` as pretty-printed JSON to a file or stdout.
pub async fn write_pretty_json<T>(output_path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let mut wtr = create_writer(output_path).await?;
    let mut json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    json.push('\n');
    wtr.write_all(json.as_bytes())
        .await
        .context("failed to write output")?;
    wtr.flush().await.context("failed to flush output")?;
    Ok(())
}

/// Read an image to upload, returning its filename and contents. Files over
/// `max_bytes` are rejected before we read them.
pub async fn read_upload(path: &Path, max_bytes: usize) -> Result<(String, Vec<u8>)> {
    let len = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to read image {:?}", path))?
        .len();
    if len > max_bytes as u64 {
        return Err(anyhow!(
            "Image {:?} is {} bytes, limit is {}",
            path,
            len,
            max_bytes
        ));
    }
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {:?}", path))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Image path {:?} has no file name", path))?;
    Ok((filename, data))
}
