use super::{
    claim_name, manifest_name, task_record_name, FailurePolicy, Manifest, SchedulerError,
    MANIFEST_PREFIX, TASK_RECORD_SUFFIX,
};
use crate::cluster::{Cluster, Job, JobId};
use crate::store::{Store, StoreError};
use crate::task::{Task, TaskConfig};
use std::collections::BTreeSet;
use tracing::{debug, error, info, instrument, warn};

/// ambient identity of one array element, resolved once at process start
/// and passed into the claim protocol unchanged
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub job_id: JobId,
    pub run_id: Option<String>,
    pub array_index: Option<u32>,
}

impl WorkerContext {
    pub fn resolve<C: Cluster>(
        cluster: &C,
        run_id: Option<String>,
        array_index: Option<u32>,
    ) -> Result<Self, SchedulerError> {
        let job = cluster.current_job()?;

        Ok(Self {
            job_id: job.id().clone(),
            run_id,
            array_index,
        })
    }
}

/// how a worker invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// claimed a task and ran it to completion
    Ran { fingerprint: String },
    /// every eligible task was already claimed by a faster worker; expected
    /// whenever the array is larger than the number of unclaimed tasks
    NothingToClaim,
}

/// claim at most one eligible task record and execute it
///
/// Records are scanned in enumeration order, which implies nothing: any
/// worker may claim any unclaimed eligible task, and exclusive creation of
/// the claim marker decides every race.
#[instrument(skip(store, context, policy), fields(job = %context.job_id, index = ?context.array_index))]
pub fn run_worker(
    store: &Store,
    context: &WorkerContext,
    policy: FailurePolicy,
) -> Result<WorkerOutcome, SchedulerError> {
    let eligible: Option<BTreeSet<String>> = match &context.run_id {
        Some(run_id) => Some(load_manifest(store, run_id)?.tasks.into_iter().collect()),
        None => None,
    };

    let host = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    debug!(host = %host, "scanning for unclaimed tasks");

    let mut claimed = None;
    for name in store.list(TASK_RECORD_SUFFIX)? {
        // manifests share the directory and the .json ending
        if name.starts_with(MANIFEST_PREFIX) {
            continue;
        }
        let value: serde_json::Value = serde_json::from_slice(&store.read(&name)?)?;
        let config = TaskConfig::from_value(value)?;
        let fingerprint = config.fingerprint().into_string();

        if let Some(eligible) = &eligible {
            if !eligible.contains(&fingerprint) {
                // leftover from some other run, not ours to touch
                continue;
            }
        }
        if !store.create_exclusive(&claim_name(&fingerprint), context.job_id.as_str().as_bytes())? {
            // another worker owns this one
            continue;
        }

        claimed = Some((fingerprint, config));
        break;
    }

    let (fingerprint, config) = match claimed {
        Some(claimed) => claimed,
        None => {
            info!("nothing left to claim");
            return Ok(WorkerOutcome::NothingToClaim);
        }
    };
    info!(fingerprint = %fingerprint, "claimed task");

    let task = Task::new(config);
    match task.run() {
        Ok(()) => {
            info!(fingerprint = %fingerprint, "task finished");
            Ok(WorkerOutcome::Ran { fingerprint })
        }
        Err(task_error) => {
            // failure hook: make the failure traceable, apply the rollback
            // policy, then let the process exit non-zero for the scheduler
            error!(
                error = ?task_error,
                fingerprint = %fingerprint,
                job = %context.job_id,
                "task failed"
            );
            apply_failure_policy(store, &fingerprint, policy);

            Err(task_error.into())
        }
    }
}

fn load_manifest(store: &Store, run_id: &str) -> Result<Manifest, SchedulerError> {
    let bytes = match store.read(&manifest_name(run_id)) {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            return Err(SchedulerError::ManifestMissing(run_id.to_owned()))
        }
        Err(error) => return Err(error.into()),
    };

    Ok(serde_json::from_slice(&bytes)?)
}

fn apply_failure_policy(store: &Store, fingerprint: &str, policy: FailurePolicy) {
    match policy {
        FailurePolicy::Keep => {
            debug!(fingerprint = %fingerprint, "keeping record and claim marker for inspection");
        }
        FailurePolicy::Rollback => {
            for name in [claim_name(fingerprint), task_record_name(fingerprint)] {
                if let Err(error) = store.remove(&name) {
                    warn!(error = ?error, name = %name, "failed to roll back after task failure");
                }
            }
        }
    }
}
