use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{ActivityWorker, DeciderWorker, WorkerContext};
use crate::storage::SchedulerConfig;

/// A set of decider and activity workers sharing one shutdown token.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured number of workers on the current runtime.
    pub fn spawn(ctx: WorkerContext, cfg: &SchedulerConfig) -> Self {
        Self::spawn_with_shutdown(ctx, cfg, CancellationToken::new())
    }

    pub fn spawn_with_shutdown(
        ctx: WorkerContext,
        cfg: &SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let mut handles = Vec::new();
        for i in 0..cfg.decider_workers {
            let worker = DeciderWorker::new(format!("decider-{i}"), ctx.clone());
            handles.push(tokio::spawn(worker.run(shutdown.child_token())));
        }
        for i in 0..cfg.activity_workers {
            let worker = ActivityWorker::new(format!("activity-{i}"), ctx.clone());
            handles.push(tokio::spawn(worker.run(shutdown.child_token())));
        }
        info!(
            deciders = cfg.decider_workers,
            activities = cfg.activity_workers,
            "worker pool started"
        );
        Self { shutdown, handles }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker to stop and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        info!("shutting down worker pool");
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}
