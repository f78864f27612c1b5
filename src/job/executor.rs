//! Snapshot job submission and completion polling.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::interfaces::{JobPlatform, PlatformError};

/// Outcome of a job that completed successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub success: bool,
    pub snapshot_id: String,
    pub duration: Duration,
    pub error_message: Option<String>,
    /// Artifact size reported by the job, if it printed a status line.
    pub snapshot_size: Option<i64>,
    pub checksum: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    InvalidJob(&'static str),

    #[error("failed to create job {job}: {source}")]
    Create {
        job: String,
        #[source]
        source: PlatformError,
    },

    #[error("job {job} failed after {attempts} attempts")]
    Failed {
        job: String,
        attempts: i32,
        duration: Duration,
        /// Tail of the job pod's output, when it could be fetched.
        logs: Option<String>,
    },

    #[error("job {job} did not finish within {timeout:?}")]
    DeadlineExceeded {
        job: String,
        timeout: Duration,
        duration: Duration,
    },

    #[error("wait for job {job} was cancelled")]
    Cancelled { job: String, duration: Duration },
}

impl JobError {
    /// Time spent before the error, where the job was actually started.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            JobError::Failed { duration, .. }
            | JobError::DeadlineExceeded { duration, .. }
            | JobError::Cancelled { duration, .. } => Some(*duration),
            JobError::InvalidJob(_) | JobError::Create { .. } => None,
        }
    }
}

/// Status line printed by `etcdutl snapshot status -w json`.
#[derive(Debug, Deserialize)]
struct SnapshotStatus {
    hash: u64,
    #[serde(rename = "totalSize")]
    total_size: i64,
}

/// Find the last JSON status line in job output.
fn parse_snapshot_status(logs: &str) -> Option<(i64, String)> {
    logs.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<SnapshotStatus>(line).ok())
        .map(|status| (status.total_size, format!("{:08x}", status.hash)))
}

enum Outcome {
    Succeeded,
    Failed(i32),
    DeadlineExceeded,
    Cancelled,
}

/// Submits jobs and waits for a terminal state.
pub struct JobExecutor {
    jobs: Arc<dyn JobPlatform>,
    poll_interval: Duration,
    delete_abandoned: bool,
}

impl JobExecutor {
    /// `delete_abandoned` deletes jobs whose wait timed out or was cancelled.
    pub fn new(jobs: Arc<dyn JobPlatform>, poll_interval: Duration, delete_abandoned: bool) -> Self {
        Self {
            jobs,
            poll_interval,
            delete_abandoned,
        }
    }

    /// Run `job` to completion, giving up after `timeout`.
    pub async fn execute(&self, job: &Job, timeout: Duration) -> Result<JobResult, JobError> {
        // Held for the whole call so the receiver never reports a change.
        let (_never, cancel) = watch::channel(false);
        self.execute_until(job, timeout, cancel).await
    }

    /// Like `execute`, but stops waiting as soon as `cancel` becomes `true`.
    ///
    /// A dropped sender also counts as cancellation.
    #[tracing::instrument(name = "job.execute", skip_all, fields(job = ?job.metadata.name))]
    pub async fn execute_until(
        &self,
        job: &Job,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<JobResult, JobError> {
        let name = job
            .metadata
            .name
            .clone()
            .ok_or(JobError::InvalidJob("metadata.name is required"))?;
        let namespace = job
            .metadata
            .namespace
            .clone()
            .ok_or(JobError::InvalidJob("metadata.namespace is required"))?;
        let labels = job.metadata.labels.clone().unwrap_or_default();
        let snapshot_id = labels.get("snapshot-id").cloned().unwrap_or_default();
        let operation = labels.get("operation").cloned().unwrap_or_default();

        info!(
            job = %name,
            operation = %operation,
            snapshot_id = %snapshot_id,
            "Executing snapshot job"
        );
        let start = Instant::now();

        match self.jobs.create_job(&namespace, job).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                debug!(job = %name, "Job already exists");
            }
            Err(source) => return Err(JobError::Create { job: name, source }),
        }

        let deadline = Instant::now() + timeout;
        let outcome = self
            .wait_for_completion(&namespace, &name, timeout, deadline, &mut cancel)
            .await;
        let duration = start.elapsed();

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, JOB_DURATION};
            let label = match &outcome {
                Outcome::Succeeded => "success",
                Outcome::Failed(_) => "failed",
                Outcome::DeadlineExceeded => "timeout",
                Outcome::Cancelled => "cancelled",
            };
            JOB_DURATION.record(
                duration.as_secs_f64(),
                &[
                    metrics::operation_attr(&operation),
                    metrics::outcome_attr(label),
                ],
            );
        }

        match outcome {
            Outcome::Succeeded => {
                let status = self
                    .fetch_logs(&namespace, &name, deadline)
                    .await
                    .and_then(|logs| parse_snapshot_status(&logs));
                info!(
                    job = %name,
                    snapshot_id = %snapshot_id,
                    operation = %operation,
                    ?duration,
                    "Snapshot job completed"
                );
                let (snapshot_size, checksum) = status.unzip();
                Ok(JobResult {
                    success: true,
                    snapshot_id,
                    duration,
                    error_message: None,
                    snapshot_size,
                    checksum,
                })
            }
            Outcome::Failed(attempts) => {
                let logs = self.fetch_logs(&namespace, &name, deadline).await;
                if let Some(logs) = &logs {
                    warn!(job = %name, logs = %logs, "Job failed, logs:");
                }
                Err(JobError::Failed {
                    job: name,
                    attempts,
                    duration,
                    logs,
                })
            }
            Outcome::DeadlineExceeded => {
                self.reap(&namespace, &name).await;
                Err(JobError::DeadlineExceeded {
                    job: name,
                    timeout,
                    duration,
                })
            }
            Outcome::Cancelled => {
                self.reap(&namespace, &name).await;
                Err(JobError::Cancelled {
                    job: name,
                    duration,
                })
            }
        }
    }

    /// Poll until the job reaches a terminal state, `deadline` passes or
    /// `cancel` fires. A status request still in flight is abandoned on
    /// either.
    async fn wait_for_completion(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> Outcome {
        if *cancel.borrow_and_update() {
            return Outcome::Cancelled;
        }

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let fetched = tokio::select! {
                biased;

                _ = &mut expired => {
                    warn!(job = %name, ?timeout, "Job execution timeout");
                    return Outcome::DeadlineExceeded;
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow_and_update() {
                        info!(job = %name, "Job wait cancelled");
                        return Outcome::Cancelled;
                    }
                    continue;
                }
                fetched = async {
                    ticker.tick().await;
                    self.jobs.get_job(namespace, name).await
                } => fetched,
            };

            let job = match fetched {
                Ok(job) => job,
                Err(e) => {
                    warn!(job = %name, error = %e, "Failed to get job status");
                    continue;
                }
            };
            let status = job.status.unwrap_or_default();

            if status.succeeded.unwrap_or(0) > 0 {
                info!(job = %name, "Job succeeded");
                return Outcome::Succeeded;
            }
            let failed = status.failed.unwrap_or(0);
            if failed > 0 {
                error!(job = %name, failed_count = failed, "Job failed");
                return Outcome::Failed(failed);
            }
            debug!(job = %name, active_pods = status.active.unwrap_or(0), "Job still running");
        }
    }

    /// Read the job's output, waiting no later than `deadline` but at least
    /// one poll interval.
    async fn fetch_logs(&self, namespace: &str, name: &str, deadline: Instant) -> Option<String> {
        let until = deadline.max(Instant::now() + self.poll_interval);
        match tokio::time::timeout_at(until, self.jobs.job_logs(namespace, name)).await {
            Ok(Ok(logs)) => Some(logs),
            Ok(Err(e)) => {
                debug!(job = %name, error = %e, "Could not read job logs");
                None
            }
            Err(_) => {
                warn!(job = %name, "Timed out reading job logs");
                None
            }
        }
    }

    async fn reap(&self, namespace: &str, name: &str) {
        if !self.delete_abandoned {
            return;
        }
        match self.jobs.delete_job(namespace, name).await {
            Ok(()) => info!(job = %name, "Deleted abandoned job"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(job = %name, error = %e, "Failed to delete abandoned job"),
        }
    }
}
