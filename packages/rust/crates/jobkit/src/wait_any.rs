//! Waiting for the first of several jobs.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use jobkit_core::{JobError, JobState, Result};
use tracing::debug;

use crate::job::Job;

/// Wait until any of `jobs` has started (`started = true`) or terminated.
///
/// All waits run concurrently; the first success wins and the remaining
/// waits are dropped. A zero `timeout` waits without bound.
///
/// # Errors
///
/// - [`JobError::InvalidArgument`] for an empty job list
/// - [`JobError::Timeout`] when no job qualifies within `timeout`
/// - [`JobError::Aggregate`] when every individual wait failed
pub async fn wait_any<'t>(started: bool, jobs: &[Job<'t>], timeout: Duration) -> Result<Job<'t>> {
    if jobs.is_empty() {
        return Err(JobError::InvalidArgument(
            "wait_any needs at least one job".to_string(),
        ));
    }
    let states = if started {
        JobState::STARTED
    } else {
        JobState::TERMINATED
    };

    let mut waits: FuturesUnordered<_> = jobs
        .iter()
        .map(|job| async move {
            job.tracker()
                .wait(job.id(), Duration::ZERO, states)
                .await
                .map(|()| job)
        })
        .collect();

    let race = async move {
        let mut errors = Vec::new();
        while let Some(outcome) = waits.next().await {
            match outcome {
                Ok(job) => return Ok(job.clone()),
                Err(e) => errors.push(e),
            }
        }
        Err(JobError::Aggregate(errors))
    };

    let winner = if timeout.is_zero() {
        race.await
    } else {
        tokio::time::timeout(timeout, race).await.map_err(|_| {
            JobError::Timeout(format!(
                "none of {} jobs {} within {timeout:?}",
                jobs.len(),
                if started { "started" } else { "terminated" }
            ))
        })?
    }?;
    debug!(job_id = winner.id(), started, "wait_any finished");
    Ok(winner)
}
