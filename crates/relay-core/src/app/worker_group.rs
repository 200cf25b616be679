//! WorkerGroup - ワーカーループとコントローラを 1 プロセス分まとめて動かす
//!
//! - `shutdown_tx` に true を送ると取り込みとコントローラが止まる
//! - `shutdown_and_join()` は実行中のタスクが終わるまで待つ

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::controller::ConcurrencyController;
use crate::app::gate::AdmissionGate;
use crate::app::worker_loop::WorkerLoop;
use crate::domain::RelayError;
use crate::observability::WorkerStatus;
use crate::ports::Broker;

pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    gate: Arc<AdmissionGate>,
    worker: JoinHandle<Result<(), RelayError>>,
    controller: Option<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn the intake loop and, when given, the concurrency controller.
    pub fn spawn(worker: Arc<WorkerLoop>, controller: Option<Arc<ConcurrencyController>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gate = Arc::clone(worker.gate());

        let controller = controller.map(|controller| {
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { controller.run(rx).await })
        });
        let worker = tokio::spawn(worker.run(shutdown_rx));

        Self {
            shutdown_tx,
            gate,
            worker,
            controller,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.gate.status()
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// Stop taking new tasks. In-flight tasks keep running.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for the loop, the controller and in-flight tasks.
    pub async fn shutdown_and_join(self) -> Result<(), RelayError> {
        self.request_shutdown();
        if let Some(controller) = self.controller {
            if let Err(e) = controller.await {
                warn!(error = %e, "controller task panicked");
            }
        }
        let result = match self.worker.await {
            Ok(result) => result,
            Err(e) => Err(RelayError::Aborted(format!("worker loop: {e}"))),
        };
        info!(status = ?self.gate.status(), "worker group stopped");
        result
    }
}

/// Poll until the broker accepts a declare on `queue`.
pub async fn wait_for_broker(
    broker: &dyn Broker,
    queue: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), RelayError> {
    let mut attempt = 1;
    loop {
        match broker.declare(queue).await {
            Ok(()) => {
                info!(queue, attempt, "broker is ready");
                return Ok(());
            }
            Err(e) if attempt < max_attempts => {
                warn!(queue, attempt, max_attempts, error = %e, "broker not ready, waiting");
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
