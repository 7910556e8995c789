pub mod array;
#[cfg(test)]
mod array_test;

use crate::cluster::{Cluster, ClusterError, Job, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use tracing_unwrap::ResultExt;
use uuid::Uuid;

/// sbatch parameters shared by every submission of one deployment
///
/// Module discovery and environment activation are the deployment's
/// business; `modules` is whatever the site wants loaded, verbatim.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default)]
    pub nodes: Option<u32>,
    #[serde(default)]
    pub ntasks_per_node: Option<u32>,
    #[serde(default)]
    pub gres: Option<String>,
    #[serde(default)]
    pub mem_per_cpu: Option<String>,
    #[serde(default = "default_mem")]
    pub mem: Option<String>,
    #[serde(default = "default_time")]
    pub time: String,
    // stdout/stderr capture patterns, %-placeholders are sbatch's own
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: None,
            qos: None,
            nodes: None,
            ntasks_per_node: None,
            gres: None,
            mem_per_cpu: None,
            mem: default_mem(),
            time: default_time(),
            output: None,
            error: None,
            job_name: default_job_name(),
            modules: Vec::new(),
            cwd: None,
        }
    }
}

fn default_mem() -> Option<String> {
    Some("16GB".to_owned())
}

fn default_time() -> String {
    "1:00:00".to_owned()
}

fn default_job_name() -> String {
    "default".to_owned()
}

/// render the batch script: one #SBATCH directive per populated config
/// field, module loads, working directory, a job info banner and finally
/// the command itself
pub fn build_sbatch_script(args: &[String], config: &SlurmConfig, array: &BTreeSet<u32>) -> String {
    let mut script = vec!["#!/bin/sh".to_owned()];

    // serializing the config gives us the directive keys without spelling
    // every field out a second time
    let fields = match serde_json::to_value(config).unwrap_or_log() {
        Value::Object(fields) => fields,
        _ => Default::default(),
    };
    for (key, value) in &fields {
        if key == "modules" || key == "cwd" {
            continue;
        }
        let value = match value {
            Value::Null => continue,
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        script.push(format!("#SBATCH --{}={}", key.replace('_', "-"), value));
    }
    if !array.is_empty() {
        script.push(format!("#SBATCH --array={}", array::format_array_arg(array)));
    }

    if !config.modules.is_empty() {
        script.push(String::new());
        script.push(format!("module load {}", config.modules.join(" ")));
    }
    if let Some(cwd) = &config.cwd {
        script.push(String::new());
        script.push(format!("cd {}", cwd.display()));
    }

    script.push(String::new());
    script.extend(
        [
            "echo \"+---------------------------------------+\"",
            "echo \"|           SLURM_JOB_INFO              |\"",
            "echo \"+---------------------------------------+\"",
            "echo \"\tSLURM_JOB_NAME     \t: ${SLURM_JOB_NAME}\"",
            "echo \"\tSLURM_JOB_ID       \t: ${SLURM_JOB_ID}\"",
            "echo \"\tSLURM_ARRAY_TASK_ID\t: ${SLURM_ARRAY_TASK_ID}\"",
            "echo \"\tSLURM_ARRAY_JOB_ID \t: ${SLURM_ARRAY_JOB_ID}\"",
            "echo \"+---------------------------------------+\"",
        ]
        .map(str::to_owned),
    );

    script.push(String::new());
    script.push(args.join(" "));

    script.join("\n")
}

// substitute {KEY} placeholders, e.g. {BASE_DIR} in log capture patterns
fn apply_vars(script: String, vars: &BTreeMap<String, String>) -> String {
    vars.iter().fold(script, |script, (key, value)| {
        script.replace(&format!("{{{key}}}"), value)
    })
}

/// hand a spooled script to sbatch and parse the job id from its output;
/// anything on stderr means the submission did not happen
pub fn sbatch(path: &Path) -> Result<SlurmJob, ClusterError> {
    let output = Command::new("sbatch")
        .arg(path)
        .output()
        .map_err(|source| ClusterError::Invoke {
            command: "sbatch",
            source,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if !stderr.is_empty() {
        return Err(ClusterError::Rejected {
            command: "sbatch",
            stderr,
        });
    }

    // "Submitted batch job 4242" -> "4242"
    let stdout = String::from_utf8_lossy(&output.stdout);
    let job_id = stdout
        .split_whitespace()
        .last()
        .ok_or_else(|| ClusterError::MalformedSubmission(stdout.trim().to_owned()))?;

    Ok(SlurmJob::new(JobId::new(job_id)?))
}

#[derive(Debug, Clone)]
pub struct SlurmJob {
    id: JobId,
}

impl SlurmJob {
    pub fn new(id: JobId) -> Self {
        Self { id }
    }
}

impl Job for SlurmJob {
    fn id(&self) -> &JobId {
        &self.id
    }

    /// aggregate state as reported by the accounting daemon; array members
    /// report individually and are reduced by precedence
    fn status(&self) -> Result<JobStatus, ClusterError> {
        let output = Command::new("sacct")
            .args(["-j", self.id.as_str(), "-X", "--noheader", "--format=state"])
            .output()
            .map_err(|source| ClusterError::Invoke {
                command: "sacct",
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        Ok(JobStatus::reduce(stdout.split_whitespace()))
    }

    fn cancel(&self) -> Result<(), ClusterError> {
        Command::new("scancel")
            .arg(self.id.as_str())
            .status()
            .map_err(|source| ClusterError::Invoke {
                command: "scancel",
                source,
            })?;

        Ok(())
    }
}

/// member jobs of an array submission, one handle per element
pub fn array_jobs(id: &JobId) -> Result<Vec<SlurmJob>, ClusterError> {
    let output = Command::new("sacct")
        .args(["-j", id.as_str(), "-X", "--noheader", "--format=jobid"])
        .output()
        .map_err(|source| ClusterError::Invoke {
            command: "sacct",
            source,
        })?;

    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .map(|raw| JobId::new(raw).map(SlurmJob::new))
        .collect()
}

/// ambient identifiers SLURM exposes to a running array element
#[derive(Debug, Clone)]
pub struct SlurmEnv {
    pub job_id: Option<String>,
    pub array_job_id: Option<String>,
    pub array_task_id: Option<u32>,
}

impl SlurmEnv {
    pub fn from_env() -> Self {
        let array_task_id = match read_env("SLURM_ARRAY_TASK_ID") {
            None => None,
            Some(raw) => match raw.parse() {
                Ok(index) => Some(index),
                Err(_) => {
                    warn!("SLURM_ARRAY_TASK_ID is not an integer: {raw}");
                    None
                }
            },
        };

        Self {
            job_id: read_env("SLURM_JOB_ID"),
            array_job_id: read_env("SLURM_ARRAY_JOB_ID"),
            array_task_id,
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone)]
pub struct SlurmCluster {
    pub config: SlurmConfig,
}

impl SlurmCluster {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    fn resolve(&self, id: Option<JobId>, ambient: Option<String>) -> Result<SlurmJob, ClusterError> {
        match id {
            Some(id) => Ok(SlurmJob::new(id)),
            None => match ambient {
                Some(raw) => Ok(SlurmJob::new(JobId::new(raw)?)),
                None => Err(ClusterError::NoAmbientJob),
            },
        }
    }
}

impl Cluster for SlurmCluster {
    type Job = SlurmJob;

    fn schedule(
        &self,
        args: &[String],
        array: &BTreeSet<u32>,
        vars: &BTreeMap<String, String>,
    ) -> Result<SlurmJob, ClusterError> {
        let script = apply_vars(build_sbatch_script(args, &self.config, array), vars);

        let spool_dir = self
            .config
            .cwd
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let path = spool_dir.join(format!(".slurm-{}.sh", Uuid::new_v4()));
        fs::write(&path, &script).map_err(ClusterError::SpoolScript)?;
        debug!(path = %path.display(), "spooled sbatch script");

        let result = sbatch(&path);

        // the spool file only matters until sbatch has copied it
        if let Err(error) = fs::remove_file(&path) {
            warn!(error = ?error, "failed to remove spooled sbatch script");
        }

        result
    }

    fn job(&self, id: Option<JobId>) -> Result<SlurmJob, ClusterError> {
        self.resolve(id, SlurmEnv::from_env().job_id)
    }

    fn array_job(&self, id: Option<JobId>) -> Result<SlurmJob, ClusterError> {
        self.resolve(id, SlurmEnv::from_env().array_job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_config() -> SlurmConfig {
        SlurmConfig {
            partition: Some("gpuq".to_owned()),
            qos: Some("gpu".to_owned()),
            nodes: Some(1),
            gres: Some("gpu:1".to_owned()),
            output: Some("{BASE_DIR}/job-%A_%a.out".to_owned()),
            modules: vec!["gnu10/10.3.0".to_owned(), "openmpi4/4.1.2".to_owned()],
            cwd: Some(PathBuf::from("/scratch/run")),
            ..SlurmConfig::default()
        }
    }

    #[test]
    fn script_carries_directives_banner_and_command() {
        let args = vec!["./herd".to_owned(), "worker".to_owned()];
        let script = build_sbatch_script(&args, &demo_config(), &(0..=2).collect());

        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("#SBATCH --partition=gpuq"));
        assert!(script.contains("#SBATCH --qos=gpu"));
        assert!(script.contains("#SBATCH --nodes=1"));
        assert!(script.contains("#SBATCH --mem=16GB"));
        assert!(script.contains("#SBATCH --time=1:00:00"));
        assert!(script.contains("#SBATCH --job-name=default"));
        assert!(script.contains("#SBATCH --array=0-2"));
        assert!(script.contains("module load gnu10/10.3.0 openmpi4/4.1.2"));
        assert!(script.contains("cd /scratch/run"));
        assert!(script.contains("SLURM_JOB_INFO"));
        assert!(script.ends_with("./herd worker"));
    }

    #[test]
    fn unset_fields_emit_no_directive() {
        let config = SlurmConfig::default();
        let script = build_sbatch_script(&["true".to_owned()], &config, &BTreeSet::new());

        assert!(!script.contains("--partition"));
        assert!(!script.contains("--gres"));
        assert!(!script.contains("--array"));
        assert!(!script.contains("module load"));
    }

    #[test]
    fn vars_substitute_placeholders() {
        let script = apply_vars(
            "#SBATCH --output={BASE_DIR}/out-%A.log\n{BASE_DIR}".to_owned(),
            &BTreeMap::from([("BASE_DIR".to_owned(), "/shared/herd".to_owned())]),
        );

        assert_eq!(script, "#SBATCH --output=/shared/herd/out-%A.log\n/shared/herd");
    }

    #[test]
    fn explicit_ids_resolve_without_an_environment() {
        let cluster = SlurmCluster::new(SlurmConfig::default());

        let job = cluster.job(Some(JobId::new("77").unwrap())).unwrap();
        assert_eq!(job.id().as_str(), "77");
    }
}
