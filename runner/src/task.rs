use crate::fingerprint::Fingerprint;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};
use tracing_unwrap::{OptionExt, ResultExt};
use wait_timeout::ChildExt;

/// discriminator field selecting the config variant of a task mapping
pub const KIND_FIELD: &str = "name";

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task kind '{0}' is not registered")]
    UnknownKind(String),
    #[error("task config has no '{KIND_FIELD}' field")]
    MissingKind,
    #[error("task config must be a mapping")]
    NotAMapping,
    #[error("task id '{0}' contains characters unsafe for file names")]
    UnsafeId(String),
    #[error("task config failed to decode")]
    Decode(#[from] serde_json::Error),
    #[error("failed to spawn task executable")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait on the task child process")]
    Wait(#[source] std::io::Error),
    #[error("task ran into its {0}s timeout")]
    Timeout(u64),
    #[error("task exited with status {0}")]
    Failed(i32),
}

type DecodeFn = fn(Value) -> Result<TaskConfig, TaskError>;

// decoder per discriminator value, resolved once at startup
// (this is deliberately not made with dynamic dispatch to avoid the headache)
static REGISTRY: Lazy<BTreeMap<&'static str, DecodeFn>> = Lazy::new(|| {
    let mut kinds: BTreeMap<&'static str, DecodeFn> = BTreeMap::new();
    kinds.insert(ExecConfig::KIND, |value| {
        Ok(TaskConfig::Exec(serde_json::from_value(value)?))
    });
    kinds.insert(SleepConfig::KIND, |value| {
        Ok(TaskConfig::Sleep(serde_json::from_value(value)?))
    });
    kinds
});

/// discriminator values with a registered decoder
pub fn registered_kinds() -> impl Iterator<Item = &'static str> {
    REGISTRY.keys().copied()
}

/// run a generic executable with fixed parameters and a wall-clock timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    // seconds; the child is killed once this is exceeded
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl ExecConfig {
    pub const KIND: &'static str = "exec";
}

fn default_timeout() -> u64 {
    3600
}

/// sleep for a while and say so, useful for exercising a fresh deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SleepConfig {
    pub seconds: u64,
    #[serde(default)]
    pub message: Option<String>,
}

impl SleepConfig {
    pub const KIND: &'static str = "sleep";
}

/// closed union of task config variants, dispatched on [`KIND_FIELD`]
#[derive(Debug, Clone)]
pub enum TaskConfig {
    Exec(ExecConfig),
    Sleep(SleepConfig),
}

impl TaskConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exec(_) => ExecConfig::KIND,
            Self::Sleep(_) => SleepConfig::KIND,
        }
    }

    /// decode a config mapping through the kind registry
    pub fn from_value(value: Value) -> Result<Self, TaskError> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            _ => return Err(TaskError::NotAMapping),
        };
        let kind = match fields.remove(KIND_FIELD) {
            Some(Value::String(kind)) => kind,
            Some(_) | None => return Err(TaskError::MissingKind),
        };

        match REGISTRY.get(kind.as_str()) {
            Some(decode) => decode(Value::Object(fields)),
            None => Err(TaskError::UnknownKind(kind)),
        }
    }

    /// ordered key-value mapping of this config, discriminator included
    pub fn to_value(&self) -> Value {
        let inner = match self {
            Self::Exec(config) => serde_json::to_value(config),
            Self::Sleep(config) => serde_json::to_value(config),
        };

        // plain data structs serialize infallibly and always to a mapping
        let mut fields = match inner.unwrap_or_log() {
            Value::Object(fields) => fields,
            other => panic!("task config serialized to a non-mapping: {other}"),
        };
        fields.insert(KIND_FIELD.to_owned(), Value::String(self.kind().to_owned()));

        Value::Object(fields)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_value(&self.to_value())
    }
}

// structural equality is fingerprint equality
impl PartialEq for TaskConfig {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for TaskConfig {}

fn id_is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// the unit of work: an identity plus a config selecting its behavior
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub config: TaskConfig,
}

impl Task {
    /// task whose identity is the config fingerprint
    pub fn new(config: TaskConfig) -> Self {
        Self {
            id: config.fingerprint().into_string(),
            config,
        }
    }

    /// task with an explicit id; ids end up in file names and must stay flat
    pub fn with_id(id: impl Into<String>, config: TaskConfig) -> Result<Self, TaskError> {
        let id = id.into();
        if !id_is_path_safe(&id) {
            return Err(TaskError::UnsafeId(id));
        }

        Ok(Self { id, config })
    }

    #[instrument(skip(self), fields(task = %self.id, kind = self.config.kind()))]
    pub fn run(&self) -> Result<(), TaskError> {
        match &self.config {
            TaskConfig::Exec(config) => run_exec(config),
            TaskConfig::Sleep(config) => run_sleep(config),
        }
    }
}

fn run_exec(config: &ExecConfig) -> Result<(), TaskError> {
    debug!(
        "processing {:?} with timeout {}",
        config.exec, config.timeout
    );

    let timeout = Duration::from_secs(config.timeout);
    let start = Instant::now();

    let mut child = Command::new(&config.exec)
        .args(config.args.iter())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(TaskError::Spawn)?;

    match child.wait_timeout(timeout).map_err(TaskError::Wait)? {
        Some(status) => {
            let elapsed = start.elapsed();
            let mut output = String::new();
            let mut stdout = child.stdout.take().unwrap_or_log();
            stdout.read_to_string(&mut output).map_err(TaskError::Wait)?;

            debug!(
                "finished in {} ns | status: {}",
                elapsed.as_nanos(),
                status.success()
            );
            trace!("output: {output}");

            match status.code() {
                Some(0) => Ok(()),
                Some(code) => Err(TaskError::Failed(code)),
                // killed by a signal
                None => Err(TaskError::Failed(-1)),
            }
        }
        None => {
            // child hasn't exited yet
            child.kill().map_err(TaskError::Wait)?;
            Err(TaskError::Timeout(config.timeout))
        }
    }
}

fn run_sleep(config: &SleepConfig) -> Result<(), TaskError> {
    if let Some(message) = &config.message {
        info!("{message}");
    }
    thread::sleep(Duration::from_secs(config.seconds));

    Ok(())
}
