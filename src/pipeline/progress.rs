//! Progress reporting for running jobs.

use std::sync::Arc;

use schemars::JsonSchema;
use tokio::time::Instant;

use crate::prelude::*;

use super::job::{JobId, Stage};

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Stage,

    /// From 0 to 100. Never decreases within one run.
    pub percent: u8,

    pub message: String,

    /// A rough estimate of the time remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

/// Something which wants to hear about progress. Delivery is best-effort.
pub trait ProgressSink: Send + Sync + 'static {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync + 'static,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Sends progress events for a single job, keeping them in order.
pub struct ProgressReporter {
    job_id: JobId,
    sink: Option<Arc<dyn ProgressSink>>,
    started: Instant,
    last_percent: u8,
}

impl ProgressReporter {
    /// Create a reporter. With no sink, reports go only to the log.
    pub fn new(job_id: JobId, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self {
            job_id,
            sink,
            started: Instant::now(),
            last_percent: 0,
        }
    }

    /// Report that we've entered `stage`.
    pub fn stage(&mut self, stage: Stage) {
        self.report(stage, stage.percent(), stage.description());
    }

    /// Report an arbitrary percentage. Values lower than one we've already
    /// reported are raised to match it.
    pub fn report(&mut self, stage: Stage, percent: u8, message: impl Into<String>) {
        let percent = percent.min(100).max(self.last_percent);
        self.last_percent = percent;
        let event = ProgressEvent {
            job_id: self.job_id,
            stage,
            percent,
            message: message.into(),
            eta_seconds: self.eta_seconds(percent),
        };
        debug!(job = %event.job_id, stage = ?event.stage, percent, "{}", event.message);
        if let Some(sink) = &self.sink {
            sink.report(event);
        }
    }

    /// Linear extrapolation from the time spent so far.
    fn eta_seconds(&self, percent: u8) -> Option<u64> {
        if percent == 0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = elapsed * f64::from(100 - percent) / f64::from(percent);
        Some(remaining.round() as u64)
    }
}
