//! Generic bounded polling
//!
//! Every "wait until the remote job is done" loop goes through
//! [`poll_until`]: sleep, query, repeat, bounded by a hard timeout that also
//! covers a query still in flight when the deadline passes.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::PipelineError;
use crate::clients::{ClientError, FailureKind};
use crate::shutdown::{sleep_or_shutdown, SharedShutdown};

/// Result of one status query
#[derive(Debug)]
pub enum PollStep<T> {
    /// Finished with a value
    Ready(T),
    /// Not finished yet
    Pending,
    /// Terminal failure; stop polling
    Failed(ClientError),
}

/// Outcome of a polling loop
#[derive(Debug)]
pub struct Polled<T> {
    /// Value, or `Timeout`/`Fatal`/`Cancelled`
    pub result: Result<T, PipelineError>,
    /// Queries performed
    pub polls: u32,
    /// Time spent
    pub elapsed: Duration,
}

/// Poll every `interval` until `query` is ready, fails, or `timeout` elapses
///
/// The first query happens after one interval. `query` receives the 1-based
/// poll number.
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    shutdown: Option<&SharedShutdown>,
    mut query: F,
) -> Polled<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PollStep<T>>,
{
    let started = Instant::now();
    let mut polls = 0u32;

    let looped = async {
        loop {
            if !sleep_or_shutdown(shutdown, interval).await {
                return Err(PipelineError::Cancelled);
            }
            polls += 1;
            match query(polls).await {
                PollStep::Ready(value) => return Ok(value),
                PollStep::Failed(error) if error.kind == FailureKind::Cancelled => {
                    return Err(PipelineError::Cancelled)
                }
                PollStep::Failed(error) => return Err(PipelineError::Fatal(error)),
                PollStep::Pending => {}
            }
        }
    };

    let result = match tokio::time::timeout(timeout, looped).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            operation: operation.to_string(),
            elapsed: started.elapsed(),
        }),
    };

    Polled {
        result,
        polls,
        elapsed: started.elapsed(),
    }
}
