//! One-shot snapshot jobs.
//!
//! - `templates`: pure builders for save and delete jobs
//! - `executor`: submits a job and polls it to a terminal state

pub mod executor;
pub mod templates;

pub use executor::{JobError, JobExecutor, JobResult};
pub use templates::{
    check_snapshot_name, generate_delete_job, generate_save_job, JobConfig, JobTls,
    SnapshotNameError,
};
