use arrayherd_runner::cluster::{Cluster, Job, JobId};
use arrayherd_runner::config::{AppConfig, ConfigErrors};
use arrayherd_runner::scheduler::driver::{submit, SubmitOptions};
use arrayherd_runner::scheduler::worker::{run_worker, WorkerContext, WorkerOutcome};
use arrayherd_runner::slurm::{SlurmCluster, SlurmEnv};
use arrayherd_runner::store::Store;
use clap::{Parser, Subcommand};
use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arrayherd", version, about = "coordinator-less array job batches on SLURM")]
struct Cli {
    /// path to the YAML application config
    #[arg(short, long, global = true, default_value = "arrayherd.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// decide which tasks to enqueue and submit them as one array job
    Schedule {
        /// override the config's cap on accepted tasks
        #[arg(long)]
        max_tasks: Option<usize>,
    },
    /// claim and execute one task (the array job re-enters this program here)
    Worker {
        /// restrict claims to the manifest of this run
        #[arg(long)]
        run_id: Option<String>,
    },
    /// aggregate status of a submitted job
    Status {
        #[arg(long)]
        job_id: String,
    },
    /// cancel a submitted job
    Cancel {
        #[arg(long)]
        job_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "arrayherd failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Schedule { max_tasks } => schedule(&cli.config, config, max_tasks),
        Commands::Worker { run_id } => worker(config, run_id),
        Commands::Status { job_id } => {
            let cluster = SlurmCluster::new(config.slurm);
            let job = cluster.job(Some(JobId::new(job_id)?))?;
            println!("{}", job.status()?);

            Ok(())
        }
        Commands::Cancel { job_id } => {
            let cluster = SlurmCluster::new(config.slurm);
            let job = cluster.job(Some(JobId::new(job_id)?))?;
            job.cancel()?;
            info!(job = %job.id(), "cancel requested");

            Ok(())
        }
    }
}

fn schedule(
    config_path: &Path,
    config: AppConfig,
    max_tasks: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    if config.preflight_checks() {
        return Err(Box::new(ConfigErrors::FailedPreflight));
    }
    let tasks = config.decode_tasks()?;
    let store = Store::dir(&config.workdir)?;
    let cluster = SlurmCluster::new(config.slurm.clone());

    // the array job re-invokes this very binary with the same config
    let exe = env::current_exe()?;
    let config_path = config_path.canonicalize()?;
    let worker_args = vec![
        exe.display().to_string(),
        "--config".to_owned(),
        config_path.display().to_string(),
        "worker".to_owned(),
    ];
    let mut options = SubmitOptions::new(worker_args);
    options.max_tasks = max_tasks.unwrap_or(config.max_tasks);

    let submission = submit(&cluster, &store, &tasks, &options)?;
    info!(
        run_id = %submission.run_id,
        job = %submission.job_id,
        tasks = submission.tasks.len(),
        "batch submitted"
    );

    Ok(())
}

fn worker(config: AppConfig, run_id: Option<String>) -> Result<(), Box<dyn Error>> {
    let store = Store::dir(&config.workdir)?;
    let cluster = SlurmCluster::new(config.slurm.clone());

    let ambient = SlurmEnv::from_env();
    let context = WorkerContext::resolve(&cluster, run_id, ambient.array_task_id)?;

    match run_worker(&store, &context, config.on_failure)? {
        WorkerOutcome::Ran { fingerprint } => {
            info!(fingerprint = %fingerprint, "worker done");
        }
        WorkerOutcome::NothingToClaim => {
            info!("no unclaimed task left for this worker");
        }
    }

    Ok(())
}
