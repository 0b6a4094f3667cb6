//! Startup of each role from parsed flags.

use crate::{Cli, Role};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use fairshare_cluster::{
    ControllerCall, ControllerClient, ControllerConfig, ControllerService, Coordinator,
    CoordinatorClient, CoordinatorConfig, HttpConnector, LoadAverage, LocalLauncher, Launcher,
    Processor, ProcessorConfig, ResourceController, ShellExecutor, SshLauncher, TaskFileSource,
};
use fairshare_core::{JobId, ProcessorId};
use fairshare_rpc::{RpcClient, RpcServer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default controller port
const CONTROLLER_PORT: u16 = 5000;
/// Default coordinator port
const COORDINATOR_PORT: u16 = 5001;
/// Timeout of one allocation push
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn run(cli: Cli, role: Role) -> Result<()> {
    match role {
        Role::Controller { name } => run_controller(&cli, name).await,
        Role::Coordinator { job } => run_coordinator(&cli, job).await,
        Role::Processor { coordinator_url } => run_processor(&cli, coordinator_url).await,
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, shutting down");
                token.cancel();
            }
            Err(err) => warn!(error = %err, "cannot listen for Ctrl-C"),
        }
    });
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn controller_client(cli: &Cli) -> ControllerClient {
    ControllerClient::from_rpc(
        RpcClient::new(&cli.controller_url).with_timeout(Duration::from_secs(cli.rpc_timeout)),
    )
}

async fn run_controller(cli: &Cli, name: String) -> Result<()> {
    let args = &cli.controller;
    let config = ControllerConfig::new(&name)
        .with_state_dir(&cli.state_dir)
        .with_overload_margin(args.overload_margin)
        .with_rebalance_interval(args.rebalance_interval)
        .with_throttle(args.throttle)
        .with_min_relaunch_interval(args.min_relaunch_interval);
    let connector = Arc::new(HttpConnector::new(PUSH_TIMEOUT));
    let controller = Arc::new(
        ResourceController::open(config, connector)
            .wrap_err_with(|| format!("loading state of controller {name}"))?,
    );

    let address = format!("0.0.0.0:{}", cli.port.unwrap_or(CONTROLLER_PORT));
    let listener = RpcServer::<ControllerCall>::bind(&address).await?;
    info!(controller = %name, %address, "controller serving");

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    let ticker = controller.spawn_periodic(shutdown.clone());

    let service: Arc<dyn ControllerService> = controller;
    let served = RpcServer::<ControllerCall>::with_shutdown(format!("controller {name}"), service, shutdown.clone())
        .serve(listener)
        .await;
    shutdown.cancel();
    if let Err(err) = ticker.await {
        warn!(error = %err, "rebalance ticker failed");
    }
    served?;
    info!(controller = %name, "controller stopped");
    Ok(())
}

async fn run_coordinator(cli: &Cli, job: String) -> Result<()> {
    let args = &cli.coordinator;
    let tasks = args
        .tasks
        .as_ref()
        .ok_or_else(|| eyre!("coordinator {job} needs --tasks"))?;
    let template = args
        .run
        .clone()
        .ok_or_else(|| eyre!("coordinator {job} needs --run"))?;
    let source = TaskFileSource::open(tasks)?;

    let port = cli.port.unwrap_or(COORDINATOR_PORT);
    let advertise = args.advertise.clone().unwrap_or_else(local_host_name);
    let url = format!("{advertise}:{port}");

    let program = std::env::current_exe()
        .wrap_err("locating the fairshare executable")?
        .display()
        .to_string();
    let mut processor_args = vec!["--run".to_string(), template];
    if let Some(level) = &cli.log_level {
        processor_args.extend(["--log-level".to_string(), level.clone()]);
    }

    let mut config = CoordinatorConfig::new(&job, &url, &cli.controller_url)
        .with_owner(&args.owner)
        .with_priority(args.priority)
        .with_job_id(args.job_id.map(JobId::new))
        .with_immediate(args.immediate)
        .with_demand_cpu(args.demand_cpu)
        .with_state_dir(&cli.state_dir)
        .with_log_dir(args.log_dir.clone().unwrap_or_else(|| cli.state_dir.clone()))
        .with_processor(program, processor_args);
    if let Some(max_clients) = args.max_clients {
        config = config.with_max_clients(max_clients);
    }
    config.request_timeout_ms = cli.rpc_timeout * 1000;

    let launcher: Arc<dyn Launcher> = if args.local {
        Arc::new(LocalLauncher)
    } else {
        Arc::new(SshLauncher::new())
    };
    let coordinator = Arc::new(
        Coordinator::new(config, Box::new(source), Arc::new(controller_client(cli)), launcher).await?,
    );

    let listener = RpcServer::<fairshare_cluster::CoordinatorCall>::bind(&format!("0.0.0.0:{port}")).await?;
    info!(%job, %url, "coordinator serving");
    cancel_on_ctrl_c(coordinator.shutdown_token());
    coordinator.run(listener).await?;
    info!(%job, "coordinator finished");
    Ok(())
}

async fn run_processor(cli: &Cli, coordinator_url: String) -> Result<()> {
    let args = &cli.processor;
    let template = cli
        .coordinator
        .run
        .clone()
        .ok_or_else(|| eyre!("processor needs --run"))?;
    let host = args.host.clone().unwrap_or_else(local_host_name);
    let timeout = Duration::from_secs(cli.rpc_timeout);

    let config = ProcessorConfig::new(&coordinator_url, &cli.controller_url)
        .with_report_interval(args.report_interval)
        .with_max_consecutive_failures(args.max_failures)
        .with_overload_max(args.overload_max);
    let coordinator = CoordinatorClient::from_rpc(RpcClient::new(&coordinator_url).with_timeout(timeout));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    let processor = Processor::new(
        config,
        ProcessorId::current(host),
        Arc::new(coordinator),
        Arc::new(controller_client(cli)),
        Arc::new(LoadAverage::new()),
    )
    .with_shutdown(shutdown);

    let summary = processor.run_all(&ShellExecutor::new(template)).await?;
    info!(
        processor = %processor.id(),
        succeeded = summary.succeeded,
        failed = summary.failed,
        "processor finished"
    );
    Ok(())
}
