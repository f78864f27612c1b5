//! JobPlatform trait definition.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;

use super::Result;

/// Upper bound on log bytes fetched for diagnostics.
pub const MAX_LOG_BYTES: i64 = 4096;

/// Submission and inspection of one-shot worker units.
#[async_trait]
pub trait JobPlatform: Send + Sync {
    /// Submit a job.
    ///
    /// Fails with `PlatformError::AlreadyExists` when a job with the same
    /// name is already present.
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Fetch a job with its current status.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job>;

    /// Delete a job and, in the background, its pods.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Fetch up to `MAX_LOG_BYTES` of log output from the first pod the job
    /// created (pods labelled `job-name=<name>`).
    async fn job_logs(&self, namespace: &str, job_name: &str) -> Result<String>;
}
