//! Bounded upload queue feeding a fixed pool of coordinator workers.
//!
//! Submitting never waits: a job that finds the queue full is rejected with
//! [`QueueError::Full`]. A dispatcher task pulls jobs off the channel and runs
//! each under a semaphore permit, so at most `workers` uploads are in flight
//! at any time.

use crate::coordinator::{UploadCoordinator, UploadJob};
use crate::error::QueueError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct UploadQueue {
    sender: Mutex<Option<mpsc::Sender<UploadJob>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Spawn the dispatcher. Must be called inside a tokio runtime.
    pub fn start(coordinator: Arc<UploadCoordinator>, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(coordinator, receiver, workers));

        info!(workers, capacity, "Upload queue started");

        Self {
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Hand a job to the worker pool without waiting for queue space
    pub fn submit(&self, job: UploadJob) -> Result<(), QueueError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(QueueError::Closed)?;

        debug!(job_id = %job.job_id, "Queueing upload job");
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Stop accepting jobs. Queued and running jobs still complete.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!("Upload queue closed");
        }
    }

    /// Close the queue and wait until every accepted job has finished
    pub async fn shutdown(&self) {
        self.close();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!(error = %e, "Upload dispatcher terminated abnormally");
            }
        }
    }
}

async fn dispatch(
    coordinator: Arc<UploadCoordinator>,
    mut jobs: mpsc::Receiver<UploadJob>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(job) = jobs.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let coordinator = coordinator.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = coordinator.run(job).await;
            debug!(?outcome, "Upload job finished");
        });
    }

    // Every permit back means every spawned job is done
    let all = u32::try_from(workers).unwrap_or(u32::MAX);
    if permits.acquire_many(all).await.is_ok() {
        info!("Upload queue drained");
    }
}
