//! The `sweep` subcommand.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use clap::Args;

use crate::{
    config::Config,
    pipeline::{
        cleanup::{CleanupReport, CleanupScheduler},
        fail_orphaned_jobs,
    },
    prelude::*,
    storage::Storage,
};

use super::write_pretty_json;

/// Sweep command line arguments.
#[derive(Debug, Args)]
pub struct SweepOpts {
    /// Only fail orphaned jobs. Don't delete any blobs.
    #[clap(long)]
    pub skip_cleanup: bool,

    /// Treat unfinished jobs as orphaned after this many minutes without a
    /// checkpoint. Defaults to `pipeline.orphan_after_minutes`.
    #[clap(long, value_name = "MINUTES")]
    pub orphan_after_minutes: Option<u32>,
}

/// What a sweep did.
#[derive(Debug, Serialize)]
struct SweepReport {
    /// Unfinished jobs we marked as failed.
    orphans_failed: usize,

    /// Cleanup tasks we ran, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    cleanup: Option<CleanupReport>,
}

/// The `sweep` subcommand.
///
/// Running jobs checkpoint at every stage, so only jobs which have gone quiet
/// for longer than the orphan cutoff are failed.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_sweep(config: &Config, opts: &SweepOpts) -> Result<()> {
    let storage = Storage::open(&config.data_dir).await?;
    let orphan_after = match opts.orphan_after_minutes {
        Some(minutes) => Duration::minutes(i64::from(minutes)),
        None => config.pipeline.orphan_after(),
    };
    let stale_before = Utc::now() - orphan_after;
    let orphans_failed =
        fail_orphaned_jobs(&*storage.jobs, &HashSet::new(), stale_before).await?;
    if orphans_failed > 0 {
        warn!(orphans_failed, "Failed orphaned jobs");
    }

    let cleanup = if opts.skip_cleanup {
        None
    } else {
        let scheduler = CleanupScheduler::new(storage.tasks.clone(), storage.blobs.clone());
        Some(scheduler.run_due(Utc::now()).await?)
    };

    write_pretty_json(
        None,
        &SweepReport {
            orphans_failed,
            cleanup,
        },
    )
    .await
}
