//! Asynchronous utilities for use with Tokio.
//!
//! Jobs run detached from whoever submitted them, so we need a small amount of
//! glue for "a task you may or may not wait for". We keep that glue here.

use std::pin::Pin;

use futures::Stream;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
///
/// Dropping a `JoinWorker` does _not_ stop the worker. This is what makes
/// "fire-and-forget" work: callers that don't care about completion simply
/// drop the handle.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels.
pub fn check_for_command_failure(command_name: &str, output: &std::process::Output) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[tokio::test]
    async fn test_join_worker_propagates_errors() {
        let ok = JoinWorker::from_handle(tokio::spawn(async { Ok(()) }));
        assert!(ok.join().await.is_ok());

        let failed =
            JoinWorker::from_handle(tokio::spawn(async { Err(anyhow!("worker broke")) }));
        let err = failed.join().await.unwrap_err();
        assert!(err.to_string().contains("worker broke"));
    }

    #[test]
    fn test_check_for_command_failure() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Error: bad input' >&2"])
            .output()
            .unwrap();
        assert!(check_for_command_failure("sh", &output).is_ok());

        let output = Command::new("sh").args(["-c", "exit 3"]).output().unwrap();
        let err = check_for_command_failure("sh", &output).unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }
}
