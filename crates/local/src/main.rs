//! The kiln worker. Start one on each execution host and point it at the manager.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use kiln_worker::{Resources, Worker, WorkerConfig};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kiln-worker", version, about = "Run tasks for a kiln manager")]
struct Cli {
    /// The manager to connect to, as host:port.
    manager: String,

    /// Directory for the artifact cache and task sandboxes. Cached artifacts found here are
    /// reported to the manager on startup.
    #[arg(long, default_value = "kiln-worker")]
    workdir: PathBuf,

    /// Name to report to the manager.
    #[arg(long)]
    name: Option<String>,

    /// Cores to advertise instead of the detected count.
    #[arg(long)]
    cores: Option<u32>,

    /// Memory to advertise, in megabytes.
    #[arg(long)]
    memory: Option<u64>,

    /// Disk to advertise, in megabytes.
    #[arg(long)]
    disk: Option<u64>,

    /// Maximum size of the artifact cache, in megabytes.
    #[arg(long)]
    cache_capacity: Option<u64>,

    /// Seconds between heartbeats.
    #[arg(long, default_value_t = 5)]
    heartbeat: u64,

    /// Bytes of standard output to keep from each task.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_output: usize,

    /// Connection attempts before giving up on the manager.
    #[arg(long, default_value_t = 5)]
    connect_retries: usize,

    /// Shell command that extracts an archive input. It runs in the destination directory
    /// with the archive path as $1.
    #[arg(long)]
    unpack_command: Option<String>,

    /// Log filter, overriding KILN_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::new(self.manager.clone(), self.workdir.clone());
        config.name = self.name.clone();
        config.cache_capacity = self.cache_capacity.map(|mb| mb * 1024 * 1024);
        config.heartbeat_interval = Duration::from_secs(self.heartbeat.max(1));
        config.max_output = self.max_output;
        config.connect_retries = self.connect_retries;
        if let Some(command) = &self.unpack_command {
            config.unpack_command = command.clone();
        }

        if self.cores.is_some() || self.memory.is_some() || self.disk.is_some() {
            let detected = Resources::detect(&self.workdir);
            config.resources = Some(Resources::new(
                self.cores.unwrap_or(detected.cores),
                self.memory.unwrap_or(detected.memory),
                self.disk.unwrap_or(detected.disk),
            ));
        }

        config
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.log_level.as_deref());

    let worker = match Worker::new(args.worker_config()) {
        Ok(worker) => worker,
        Err(e) => {
            event!(Level::ERROR, error = ?e, "failed to start worker");
            return ExitCode::FAILURE;
        }
    };
    event!(
        Level::INFO,
        name = %worker.name(),
        resources = %worker.resources(),
        manager = %args.manager,
        "worker starting"
    );

    tokio::select! {
        result = worker.run() => match result {
            Ok(()) => {
                event!(Level::INFO, "manager shut down, exiting");
                ExitCode::SUCCESS
            }
            Err(e) => {
                event!(Level::ERROR, error = ?e, "worker failed");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            event!(Level::INFO, "interrupted, exiting");
            ExitCode::SUCCESS
        }
    }
}
