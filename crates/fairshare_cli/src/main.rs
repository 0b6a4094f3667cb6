//! FAIRSHARE CLI
//!
//! One binary for all three tiers. The role follows from the flags:
//! `--coordinator-url` runs a processor, `--controller-name` runs the
//! resource controller, anything else runs the coordinator of the job
//! named by the first positional argument.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod daemon;
mod roles;

use clap::{Args, Parser};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `--log-level` nor `RUST_LOG` is set
const DEFAULT_FILTER: &str = "warn,fairshare=info";

#[derive(Parser, Debug)]
#[command(name = "fairshare")]
#[command(about = "FAIRSHARE - fair-share batch processing over a pool of hosts", long_about = None)]
struct Cli {
    /// Job name; runs the coordinator of this job
    job: Option<String>,

    /// Run as a processor of the coordinator at this address
    #[arg(long, env = "FAIRSHARE_COORDINATOR_URL")]
    coordinator_url: Option<String>,

    /// Run as the resource controller with this name
    #[arg(long)]
    controller_name: Option<String>,

    /// Resource controller address
    #[arg(long, env = "FAIRSHARE_CONTROLLER_URL", default_value = "localhost:5000")]
    controller_url: String,

    /// Port to serve on (controller 5000, coordinator 5001)
    #[arg(long)]
    port: Option<u16>,

    /// Directory for state files
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Log filter, overriding RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Detach into the background, logging to --log-file
    #[arg(long)]
    daemon: bool,

    /// Log file used with --daemon
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Timeout for calls to other servers in seconds
    #[arg(long, default_value_t = 30)]
    rpc_timeout: u64,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(flatten)]
    coordinator: CoordinatorArgs,

    #[command(flatten)]
    processor: ProcessorArgs,
}

/// Resource controller options
#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Load allowed above a host's max load
    #[arg(long, default_value_t = 0.6)]
    overload_margin: f64,

    /// Seconds between periodic rebalances
    #[arg(long, default_value_t = 1200)]
    rebalance_interval: u64,

    /// Capacity multiplier applied to the host table
    #[arg(long, default_value_t = 1.0)]
    throttle: f64,

    /// Seconds before a coordinator may be sent new hosts again
    #[arg(long, default_value_t = 60)]
    min_relaunch_interval: u64,
}

/// Coordinator options
#[derive(Args, Debug, Clone)]
struct CoordinatorArgs {
    /// File listing one task ID per line
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Shell command run per task; `{task}` is replaced by the task ID
    #[arg(long)]
    run: Option<String>,

    /// Fair-share priority
    #[arg(long, default_value_t = 1.0)]
    priority: f64,

    /// Explicit job ID
    #[arg(long)]
    job_id: Option<u64>,

    /// Schedule regardless of job ordering
    #[arg(long)]
    immediate: bool,

    /// Fixed number of CPUs instead of a priority share
    #[arg(long, default_value_t = 0)]
    demand_cpu: usize,

    /// Cap on concurrent processors
    #[arg(long)]
    max_clients: Option<usize>,

    /// Host name processors and the controller reach this coordinator at
    #[arg(long)]
    advertise: Option<String>,

    /// Directory for per-launch processor logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Start processors as local children instead of over ssh
    #[arg(long)]
    local: bool,

    /// Job owner
    #[arg(long, env = "USER", default_value = "")]
    owner: String,
}

/// Processor options
#[derive(Args, Debug, Clone)]
struct ProcessorArgs {
    /// Host entry this processor was launched for
    #[arg(long)]
    host: Option<String>,

    /// Seconds between load reports
    #[arg(long, default_value_t = 600)]
    report_interval: u64,

    /// Consecutive task failures tolerated
    #[arg(long, default_value_t = 10)]
    max_failures: usize,

    /// Consecutive overloaded load reports before exiting
    #[arg(long, default_value_t = 5)]
    overload_max: usize,
}

/// What this process runs as
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Processor { coordinator_url: String },
    Controller { name: String },
    Coordinator { job: String },
}

impl Cli {
    fn role(&self) -> Result<Role> {
        if let Some(coordinator_url) = &self.coordinator_url {
            return Ok(Role::Processor {
                coordinator_url: coordinator_url.clone(),
            });
        }
        if let Some(name) = &self.controller_name {
            return Ok(Role::Controller { name: name.clone() });
        }
        match &self.job {
            Some(job) => Ok(Role::Coordinator { job: job.clone() }),
            None => Err(eyre!(
                "nothing to run: give a job name, --controller-name or --coordinator-url"
            )),
        }
    }

    fn default_log_file(&self, role: &Role) -> PathBuf {
        let stem = match role {
            Role::Processor { .. } => "processor",
            Role::Controller { name } => name.as_str(),
            Role::Coordinator { job } => job.as_str(),
        };
        self.state_dir.join(format!("{stem}.log"))
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let role = cli.role()?;

    if cli.daemon {
        let log_file = cli
            .log_file
            .clone()
            .unwrap_or_else(|| cli.default_log_file(&role));
        return daemon::detach(&log_file);
    }

    init_logging(cli.log_level.as_deref());
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(roles::run(cli, role))
}
