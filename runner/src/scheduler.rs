pub mod driver;
pub mod worker;

use crate::cluster::{ClusterError, JobId, JobStatus};
use crate::store::StoreError;
use crate::task::TaskError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/*
 * The working directory is the whole coordination layer:
 * <fp>-task.json       task record, created exclusively by the driver
 * <fp>-worker.txt      claim marker, created exclusively by one worker
 * manifest-<run>.json  fingerprints one submission is responsible for
 * manifest-<run>.job   scheduler job id backing that submission
 * Nothing is ever overwritten; exclusive creation decides every race.
 */

pub const TASK_RECORD_SUFFIX: &str = "-task.json";
pub const CLAIM_SUFFIX: &str = "-worker.txt";
pub const MANIFEST_PREFIX: &str = "manifest-";
pub const MANIFEST_SUFFIX: &str = ".json";
pub const JOB_MARKER_SUFFIX: &str = ".job";

pub fn task_record_name(fingerprint: &str) -> String {
    format!("{fingerprint}{TASK_RECORD_SUFFIX}")
}

pub fn claim_name(fingerprint: &str) -> String {
    format!("{fingerprint}{CLAIM_SUFFIX}")
}

pub fn manifest_name(run_id: &str) -> String {
    format!("{MANIFEST_PREFIX}{run_id}{MANIFEST_SUFFIX}")
}

pub fn job_marker_name(run_id: &str) -> String {
    format!("{MANIFEST_PREFIX}{run_id}{JOB_MARKER_SUFFIX}")
}

/// binds a submission run to the task fingerprints it is responsible for;
/// written once by the driver, read-only to workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub tasks: Vec<String>,
}

/// what happens to a claimed task's on-disk state when execution fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// leave the record and claim marker in place so the failed job can be
    /// traced; the task is never retried automatically
    #[default]
    Keep,
    /// delete the record and claim marker so a future submission treats
    /// the task as new and resubmits it
    Rollback,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no tasks to run")]
    NothingToRun,
    #[error("run {run_id} is still {status} as job {job_id}")]
    OutstandingRun {
        run_id: String,
        job_id: JobId,
        status: JobStatus,
    },
    #[error("manifest for run {0} already exists")]
    ManifestExists(String),
    #[error("manifest for run {0} was not found")]
    ManifestMissing(String),
    #[error("stored record is not valid JSON")]
    MalformedRecord(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Task(#[from] TaskError),
}
