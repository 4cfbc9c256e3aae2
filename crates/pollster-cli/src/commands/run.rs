use clap::Args;
use pollster_core::WorkerPool;
use tracing::{info, warn};

use super::{open_service, CliResult};

#[derive(Args)]
pub struct RunArgs {
    /// Override the number of decider workers
    #[arg(long)]
    pub deciders: Option<u32>,
    /// Override the number of activity workers
    #[arg(long)]
    pub activities: Option<u32>,
}

/// Host the workflow workers until Ctrl-C.
pub async fn run(args: RunArgs) -> CliResult {
    let (config, service) = open_service()?;
    let mut scheduler = config.scheduler.clone();
    if let Some(n) = args.deciders {
        scheduler.decider_workers = n;
    }
    if let Some(n) = args.activities {
        scheduler.activity_workers = n;
    }

    let recovered = service.recover().await?;
    if recovered > 0 {
        info!(recovered, "scheduled polls that had no workflow");
    }

    let pool = WorkerPool::spawn(service.worker_context(), &scheduler);
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl-C; shutting down");
    }
    pool.shutdown().await;
    Ok(())
}
