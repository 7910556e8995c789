use super::{
    claim_name, job_marker_name, manifest_name, task_record_name, Manifest, SchedulerError,
    JOB_MARKER_SUFFIX, MANIFEST_PREFIX,
};
use crate::cluster::{Cluster, Job, JobId, JobStatus};
use crate::fingerprint::Fingerprint;
use crate::store::Store;
use crate::task::TaskConfig;
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_TASKS: usize = 20;

/// driver-side submission parameters
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// cap on tasks accepted into one batch
    pub max_tasks: usize,
    /// argv that re-enters this program in worker mode; the run id is
    /// appended as `--run-id <id>`
    pub worker_args: Vec<String>,
}

impl SubmitOptions {
    pub fn new(worker_args: Vec<String>) -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            worker_args,
        }
    }
}

/// an accepted submission batch
#[derive(Debug, Clone)]
pub struct Submission {
    pub run_id: String,
    pub job_id: JobId,
    /// fingerprints this run is responsible for, in acceptance order
    pub tasks: Vec<String>,
}

/// decide which configs to enqueue, persist the manifest and hand the
/// batch to the cluster as one array job
#[instrument(skip_all, fields(configs = configs.len()))]
pub fn submit<C: Cluster>(
    cluster: &C,
    store: &Store,
    configs: &[TaskConfig],
    options: &SubmitOptions,
) -> Result<Submission, SchedulerError> {
    ensure_no_outstanding_run(cluster, store)?;

    let mut accepted: Vec<String> = Vec::new();
    for config in configs {
        if accepted.len() >= options.max_tasks {
            break;
        }
        let fingerprint = config.fingerprint();
        let record = serde_json::to_vec_pretty(&config.to_value())?;
        if !store.create_exclusive(&task_record_name(fingerprint.as_str()), &record)? {
            // recorded by an earlier run: completed, in flight or claimed
            debug!(fingerprint = %fingerprint, "skipping known task");
            continue;
        }
        if store.exists(&claim_name(fingerprint.as_str()))? {
            // a job already owns this fingerprint
            debug!(fingerprint = %fingerprint, "skipping claimed task");
            continue;
        }
        accepted.push(fingerprint.into_string());
    }

    if accepted.is_empty() {
        return Err(SchedulerError::NothingToRun);
    }
    debug!("accepted: {}", accepted.iter().join(", "));

    let run_id = Fingerprint::of_bytes(Uuid::new_v4().as_bytes()).into_string();
    let manifest = Manifest {
        run_id: run_id.clone(),
        tasks: accepted.clone(),
    };
    if !store.create_exclusive(&manifest_name(&run_id), &serde_json::to_vec(&manifest)?)? {
        return Err(SchedulerError::ManifestExists(run_id));
    }

    let mut args = options.worker_args.clone();
    args.push("--run-id".to_owned());
    args.push(run_id.clone());

    let array = (0..accepted.len() as u32).collect();
    let mut vars = BTreeMap::new();
    if let Some(dir) = store.dir_path() {
        vars.insert("BASE_DIR".to_owned(), dir.display().to_string());
    }

    let job = match cluster.schedule(&args, &array, &vars) {
        Ok(job) => job,
        Err(error) => {
            // a failed submission must not leave state that poisons a retry
            rollback_submission(store, &run_id, &accepted);
            return Err(error.into());
        }
    };

    store.create_exclusive(&job_marker_name(&run_id), job.id().as_str().as_bytes())?;
    info!(
        run_id = %run_id,
        job = %job.id(),
        tasks = accepted.len(),
        "submitted array job"
    );

    Ok(Submission {
        run_id,
        job_id: job.id().clone(),
        tasks: accepted,
    })
}

/// refuse to double-submit the same logical workload while a previous run
/// is still pending or running
fn ensure_no_outstanding_run<C: Cluster>(
    cluster: &C,
    store: &Store,
) -> Result<(), SchedulerError> {
    for name in store.list(JOB_MARKER_SUFFIX)? {
        let run_id = match name
            .strip_prefix(MANIFEST_PREFIX)
            .and_then(|rest| rest.strip_suffix(JOB_MARKER_SUFFIX))
        {
            Some(run_id) => run_id.to_owned(),
            None => continue,
        };
        let raw = String::from_utf8_lossy(&store.read(&name)?).trim().to_owned();
        let job = cluster.job(Some(JobId::new(raw)?))?;
        let status = job.status()?;
        debug!(run_id = %run_id, job = %job.id(), status = %status, "prior run");

        if matches!(status, JobStatus::Pending | JobStatus::Running) {
            return Err(SchedulerError::OutstandingRun {
                run_id,
                job_id: job.id().clone(),
                status,
            });
        }
    }

    Ok(())
}

fn rollback_submission(store: &Store, run_id: &str, fingerprints: &[String]) {
    if let Err(error) = store.remove(&manifest_name(run_id)) {
        warn!(error = ?error, run_id = %run_id, "failed to remove manifest after submission failure");
    }
    for fingerprint in fingerprints {
        if let Err(error) = store.remove(&task_record_name(fingerprint)) {
            warn!(error = ?error, fingerprint = %fingerprint, "failed to remove task record after submission failure");
        }
    }
}
