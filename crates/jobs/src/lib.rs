mod dedup;
mod dispatch;
mod measurement;

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
pub use dedup::{DedupGuard, RunPermit};
pub use dispatch::{DispatchError, Dispatched, Dispatcher};
pub use measurement::{MeasurementJob, abandon_measurement_job, process_measurement_job};
use power_check_bench::{ArtifactStore, Bench};
use power_check_circleci::poller::PipelinePoller;
use power_check_core::config::{Config, WorkerConfig};
use tokio::{
    sync::{Mutex, Semaphore, mpsc, watch},
    task::JoinSet,
};

/// Time runs get to report their cancellation before their tasks are aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Shared context available to all measurement runs.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    pub poller: PipelinePoller,
    pub bench: Arc<dyn Bench>,
    pub store: Arc<dyn ArtifactStore>,
    /// There is one physical bench. Held from flashing until the last upload.
    pub bench_lock: Arc<Mutex<()>>,
}

/// Tells measurement runs to stop and complete their check run as cancelled.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn never() -> Self { Self::channel().1 }

    /// Resolves once cancellation is signalled. Never resolves if the sender is
    /// gone without signalling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle for pushing runs from request handlers.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<MeasurementJob>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeasurementJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, job: MeasurementJob) -> Result<(), MeasurementJob> {
        self.tx.send(job).map_err(|e| e.0)
    }
}

/// Consumes the queue and runs each measurement in its own task.
pub struct Worker {
    context: JobContext,
    jobs: mpsc::UnboundedReceiver<MeasurementJob>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        context: JobContext,
        jobs: mpsc::UnboundedReceiver<MeasurementJob>,
        config: WorkerConfig,
    ) -> Self {
        Self { context, jobs, config }
    }

    /// Run until `shutdown` resolves or every queue handle is dropped.
    ///
    /// On shutdown, runs that have not started are completed as cancelled.
    /// Runs in progress get the shutdown timeout to finish, then are told to
    /// stop and report cancellation themselves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let (cancel_tx, cancel) = Cancellation::channel();
        let mut set = JoinSet::new();
        tokio::pin!(shutdown);
        let interrupted = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break true,
                Some(result) = set.join_next(), if !set.is_empty() => log_join(result),
                job = self.jobs.recv() => {
                    let Some(job) = job else { break false };
                    let sem = sem.clone();
                    let ctx = self.context.clone();
                    let cancel = cancel.clone();
                    set.spawn(async move {
                        let Ok(_permit) = sem.acquire().await else {
                            return abandon_measurement_job(job).await;
                        };
                        process_measurement_job(job, ctx, cancel).await
                    });
                }
            }
        };

        if interrupted {
            // Runs waiting for a slot see the closed semaphore and give up.
            sem.close();
        }
        self.jobs.close();
        let mut abandoned = 0;
        while let Ok(job) = self.jobs.try_recv() {
            set.spawn(abandon_measurement_job(job));
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!("Cancelling {} queued measurement runs", abandoned);
        }
        if set.is_empty() {
            return;
        }
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        tracing::info!("Waiting up to {}s for {} measurement runs", timeout.as_secs(), set.len());
        if drain(&mut set, timeout).await {
            return;
        }
        tracing::warn!("Cancelling {} measurement runs", set.len());
        let _ = cancel_tx.send(true);
        if !drain(&mut set, CANCEL_GRACE).await {
            tracing::warn!("Aborting {} measurement runs", set.len());
            set.shutdown().await;
        }
    }
}

/// Join tasks until the set is empty or `timeout` passes. True if emptied.
async fn drain(set: &mut JoinSet<()>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while let Some(result) = set.join_next().await {
            log_join(result);
        }
    })
    .await
    .is_ok()
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Measurement task failed: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod testing;
