use crate::scheduler::driver::DEFAULT_MAX_TASKS;
use crate::scheduler::FailurePolicy;
use crate::slurm::SlurmConfig;
use crate::task::{registered_kinds, TaskConfig, TaskError, KIND_FIELD};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::Error;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;
use tracing::{error, warn};

// check if a task target is executable
fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum ConfigErrors {
    #[error("failed to read the config file")]
    Read(#[from] Error),
    #[error("config file is not valid YAML")]
    Parse(#[from] serde_yaml::Error),
    #[error("config failed preflight checks")]
    FailedPreflight,
    #[error("file not found")]
    FileNotFound,
    #[error("metadata not found")]
    MetadataNotFound(Error),
    #[error("task config failed to decode")]
    Task(#[from] TaskError),
}

/// application config for the command line runner
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    // shared working directory every worker and the driver can reach
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    // cap on tasks accepted per submission batch
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    // what to do with a failed task's record and claim marker
    #[serde(default)]
    pub on_failure: FailurePolicy,
    pub slurm: SlurmConfig,
    // task mappings, dispatched on their "name" field
    #[serde(default)]
    pub tasks: Vec<Value>,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("arrayherd")
}

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// decode every task mapping through the kind registry
    pub fn decode_tasks(&self) -> Result<Vec<TaskConfig>, ConfigErrors> {
        self.tasks
            .iter()
            .cloned()
            .map(|value| TaskConfig::from_value(value).map_err(ConfigErrors::Task))
            .collect()
    }

    /// attempt to catch all errors instead of piece-by-piece to make
    /// debugging easier for users; returns whether any check failed
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;
        let supported: Vec<&str> = registered_kinds().collect();

        if self.tasks.is_empty() {
            error!("no tasks defined, unable to build a submission batch");
            contains_error = true;
        }
        if self.max_tasks == 0 {
            error!("max_tasks cannot be 0, the driver would always refuse to submit");
            contains_error = true;
        }
        if self.workdir.is_relative() && self.slurm.cwd.is_none() {
            warn!(
                "workdir {} is relative and slurm.cwd is unset, workers might resolve it differently",
                self.workdir.display()
            );
        }

        for (index, value) in self.tasks.iter().enumerate() {
            match value.get(KIND_FIELD).and_then(Value::as_str) {
                None => {
                    error!("tasks[{index}] has no '{KIND_FIELD}' field");
                    contains_error = true;
                    continue;
                }
                Some(kind) if !supported.contains(&kind) => {
                    error!(
                        "tasks[{index}].{KIND_FIELD} ({kind}) is not supported, please use one of: {}",
                        supported.iter().join(", ")
                    );
                    contains_error = true;
                    continue;
                }
                Some(_) => {}
            }

            match TaskConfig::from_value(value.clone()) {
                Err(e) => {
                    error!("tasks[{index}] failed to decode: {e}");
                    contains_error = true;
                }
                Ok(TaskConfig::Exec(exec)) => {
                    if exec.timeout == 0 {
                        error!(
                            "tasks[{index}].timeout cannot be 0, the child would be killed immediately"
                        );
                        contains_error = true;
                    }
                    match check_executable(&exec.exec) {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(
                                "tasks[{index}].exec ({}) is not executable, this might cause problems",
                                exec.exec.display()
                            );
                            contains_error = true;
                        }
                        Err(e) => {
                            error!(
                                "failed to determine if tasks[{index}].exec ({}) is an executable: {e}",
                                exec.exec.display()
                            );
                            contains_error = true;
                        }
                    }
                }
                Ok(TaskConfig::Sleep(_)) => {}
            }
        }

        contains_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> AppConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse("slurm: {}\n");

        assert_eq!(config.workdir, PathBuf::from("arrayherd"));
        assert_eq!(config.max_tasks, DEFAULT_MAX_TASKS);
        assert_eq!(config.on_failure, FailurePolicy::Keep);
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn tasks_decode_through_the_registry() {
        let config = parse(
            "slurm: {}\n\
             on_failure: rollback\n\
             tasks:\n\
             - name: sleep\n\
             \x20 seconds: 3\n\
             - name: exec\n\
             \x20 exec: /bin/true\n",
        );

        assert_eq!(config.on_failure, FailurePolicy::Rollback);
        let tasks = config.decode_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].kind(), "sleep");
        assert_eq!(tasks[1].kind(), "exec");
    }

    #[test]
    fn preflight_flags_empty_and_unknown_tasks() {
        assert!(parse("slurm: {}\n").preflight_checks());

        let unknown = parse("slurm: {}\ntasks:\n- name: teleport\n");
        assert!(unknown.preflight_checks());

        let nameless = parse("slurm: {}\ntasks:\n- seconds: 3\n");
        assert!(nameless.preflight_checks());
    }

    #[test]
    fn preflight_accepts_a_sound_config() {
        let config = parse(
            "slurm: {}\n\
             tasks:\n\
             - name: exec\n\
             \x20 exec: /bin/true\n\
             - name: sleep\n\
             \x20 seconds: 1\n",
        );

        assert!(!config.preflight_checks());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<AppConfig>("slurm: {}\nturbo: yes\n").is_err());
    }
}
