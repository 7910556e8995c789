use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("job id must be a non-empty string")]
    EmptyJobId,
    #[error("no ambient job id in the environment, not running under the scheduler?")]
    NoAmbientJob,
    #[error("failed to spool the submission script")]
    SpoolScript(#[source] std::io::Error),
    #[error("failed to invoke {command}")]
    Invoke {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    Rejected {
        command: &'static str,
        stderr: String,
    },
    #[error("could not parse a job id from submission output '{0}'")]
    MalformedSubmission(String),
}

/// opaque, validated scheduler-side job identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, ClusterError> {
        let id = id.into().trim().to_owned();
        if id.is_empty() {
            return Err(ClusterError::EmptyJobId);
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

// any member still pending or running dominates the aggregate; among the
// terminal states a cancellation is more urgent to report than a failure
pub const STATUS_PRECEDENCE: [JobStatus; 5] = [
    JobStatus::Pending,
    JobStatus::Running,
    JobStatus::Cancelled,
    JobStatus::Failed,
    JobStatus::Completed,
];

impl JobStatus {
    pub fn token(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// collapse the raw per-member status tokens of an array job into one
    /// aggregate status
    pub fn reduce<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: BTreeSet<String> = tokens
            .into_iter()
            .map(|token| token.as_ref().trim().to_uppercase())
            .collect();

        for status in STATUS_PRECEDENCE {
            if tokens.contains(status.token()) {
                return status;
            }
        }

        Self::Unknown
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// handle to a scheduler-side job; the status is re-derived from the
/// backend on every query, never cached
pub trait Job {
    fn id(&self) -> &JobId;

    fn status(&self) -> Result<JobStatus, ClusterError>;

    fn cancel(&self) -> Result<(), ClusterError>;
}

/// a batch backend that can launch an indexed array of processes and
/// report per-job state on demand
pub trait Cluster {
    type Job: Job;

    /// submit `args` to run once per index in `array`; `vars` are
    /// substituted for `{KEY}` placeholders in any generated script
    fn schedule(
        &self,
        args: &[String],
        array: &BTreeSet<u32>,
        vars: &BTreeMap<String, String>,
    ) -> Result<Self::Job, ClusterError>;

    /// resolve a job by id or, if omitted, from the ambient environment of
    /// the currently executing worker process
    fn job(&self, id: Option<JobId>) -> Result<Self::Job, ClusterError>;

    /// resolve the first/parent job of an array
    fn array_job(&self, id: Option<JobId>) -> Result<Self::Job, ClusterError>;

    fn current_job(&self) -> Result<Self::Job, ClusterError> {
        self.job(None)
    }

    fn current_array_job(&self) -> Result<Self::Job, ClusterError> {
        self.array_job(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_must_not_be_empty() {
        assert!(matches!(JobId::new(""), Err(ClusterError::EmptyJobId)));
        assert!(matches!(JobId::new("  \n"), Err(ClusterError::EmptyJobId)));
        assert_eq!(JobId::new(" 4242 ").unwrap().as_str(), "4242");
    }

    #[test]
    fn pending_dominates_terminal_states() {
        assert_eq!(
            JobStatus::reduce(["COMPLETED", "PENDING"]),
            JobStatus::Pending
        );
        assert_eq!(
            JobStatus::reduce(["RUNNING", "COMPLETED", "FAILED"]),
            JobStatus::Running
        );
    }

    #[test]
    fn failure_dominates_completion() {
        assert_eq!(
            JobStatus::reduce(["COMPLETED", "FAILED"]),
            JobStatus::Failed
        );
        assert_eq!(
            JobStatus::reduce(["COMPLETED", "FAILED", "CANCELLED"]),
            JobStatus::Cancelled
        );
    }

    #[test]
    fn empty_and_foreign_tokens_reduce_to_unknown() {
        assert_eq!(JobStatus::reduce(Vec::<String>::new()), JobStatus::Unknown);
        assert_eq!(JobStatus::reduce(["REQUEUED", "by"]), JobStatus::Unknown);
    }

    #[test]
    fn reduce_normalizes_case_and_whitespace() {
        assert_eq!(
            JobStatus::reduce([" pending ", "completed"]),
            JobStatus::Pending
        );
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
    }
}
