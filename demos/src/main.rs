use anyhow::Result;
use arrayherd_runner::scheduler::driver::{submit, SubmitOptions};
use arrayherd_runner::scheduler::worker::{run_worker, WorkerContext, WorkerOutcome};
use arrayherd_runner::scheduler::FailurePolicy;
use arrayherd_runner::slurm::{SlurmCluster, SlurmConfig, SlurmEnv};
use arrayherd_runner::store::Store;
use arrayherd_runner::task::{SleepConfig, TaskConfig};
use clap::{Parser, Subcommand};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// schedule a handful of sleepy example tasks as one array job
#[derive(Parser, Debug)]
#[command(name = "sleepers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// claim and run one task; the array job re-enters this binary here
    Worker {
        #[arg(long)]
        run_id: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = SlurmConfig {
        partition: Some("contrib-gpuq".to_owned()),
        qos: Some("gpu".to_owned()),
        nodes: Some(1),
        ntasks_per_node: Some(1),
        gres: Some("gpu:3g.40gb:1".to_owned()),
        mem: Some("32G".to_owned()),
        output: Some("{BASE_DIR}/job-%j-slurm-%x-%A_%a-%N.out".to_owned()),
        error: Some("{BASE_DIR}/job-%j-slurm-%x-%A_%a-%N.err".to_owned()),
        ..SlurmConfig::default()
    };
    let cluster = SlurmCluster::new(config);
    let store = Store::dir("sleepers-herd")?;

    match cli.command {
        Some(Commands::Worker { run_id }) => {
            let ambient = SlurmEnv::from_env();
            let context = WorkerContext::resolve(&cluster, run_id, ambient.array_task_id)?;
            match run_worker(&store, &context, FailurePolicy::Keep)? {
                WorkerOutcome::Ran { fingerprint } => info!(fingerprint = %fingerprint, "done"),
                WorkerOutcome::NothingToClaim => info!("beaten to every task"),
            }
        }
        None => {
            let tasks: Vec<TaskConfig> = ["Alice", "Bob", "Charlie"]
                .into_iter()
                .map(|name| {
                    TaskConfig::Sleep(SleepConfig {
                        seconds: 20,
                        message: Some(format!("running task for {name}")),
                    })
                })
                .collect();

            let exe = env::current_exe()?;
            let options = SubmitOptions::new(vec![exe.display().to_string(), "worker".to_owned()]);
            let submission = submit(&cluster, &store, &tasks, &options)?;
            info!(
                run_id = %submission.run_id,
                job = %submission.job_id,
                "submitted {} tasks",
                submission.tasks.len()
            );
        }
    }

    Ok(())
}
