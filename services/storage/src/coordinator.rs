//! Upload coordinator: runs one upload job from status bookkeeping to the
//! published outcome.
//!
//! The three external systems are written in a fixed order and never inside a
//! shared transaction:
//!
//! ```text
//! status store: IN_PROGRESS ──▶ blob transfer ──▶ bus: url-update | delete
//! ```
//!
//! Terminal statuses are written by the reconciliation listener, never here.

use crate::blob::{BlobEndpoint, BlobTransfer};
use crate::bus::{NotificationBus, Outcome};
use crate::job::{JobId, UploadStatus};
use crate::status_store::StatusStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tracing::{error, info, instrument, warn};

/// One upload handed over by admission
#[derive(Debug)]
pub struct UploadJob {
    pub job_id: JobId,
    pub photo_id: i64,
    /// Blob name of the upload
    pub file_name: String,
    pub file: File,
}

impl UploadJob {
    pub fn new(photo_id: i64, file_name: impl Into<String>, file: File) -> Self {
        Self {
            job_id: JobId::for_photo(photo_id),
            photo_id,
            file_name: file_name.into(),
            file,
        }
    }
}

/// How far a job got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// `IN_PROGRESS` could not be recorded; nothing was transferred
    Aborted,
    /// Blob stored; `published` tells whether the url-update reached the bus
    Transferred { published: bool },
    /// Blob transfer failed; `published` tells whether the delete reached the bus
    TransferFailed { published: bool },
}

/// Drives upload jobs through status store, blob service and bus
pub struct UploadCoordinator {
    status: Arc<dyn StatusStore>,
    blob: Arc<dyn BlobTransfer>,
    bus: Arc<dyn NotificationBus>,
    endpoint: BlobEndpoint,
}

impl UploadCoordinator {
    pub fn new(
        status: Arc<dyn StatusStore>,
        blob: Arc<dyn BlobTransfer>,
        bus: Arc<dyn NotificationBus>,
        endpoint: BlobEndpoint,
    ) -> Self {
        Self {
            status,
            blob,
            bus,
            endpoint,
        }
    }

    /// Run a job to completion. Failures are logged, never returned: the
    /// caller that admitted the job has already been answered.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, photo_id = job.photo_id))]
    pub async fn run(&self, job: UploadJob) -> JobOutcome {
        let UploadJob {
            job_id,
            photo_id,
            file_name,
            file,
        } = job;

        // An unrecorded job can never be reconciled by polling, so fail fast
        if let Err(e) = self.status.set_status(&job_id, UploadStatus::InProgress).await {
            error!(error = %e, "Failed to record upload start, job aborted");
            metrics::counter!("gallery.jobs.aborted").increment(1);
            return JobOutcome::Aborted;
        }

        let started = Instant::now();
        let transfer = self.blob.upload_file(file, &file_name).await;
        metrics::histogram!("gallery.transfer.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let outcome = match transfer {
            Ok(()) => {
                let url = self.endpoint.url_for(&file_name);
                info!(blob = %file_name, url = %url, "Transfer succeeded");
                metrics::counter!("gallery.transfers.succeeded").increment(1);
                Outcome::UrlUpdate { photo_id, url }
            }
            Err(e) => {
                warn!(blob = %file_name, error = %e, "Transfer failed");
                metrics::counter!("gallery.transfers.failed").increment(1);
                Outcome::Delete { photo_id }
            }
        };

        // At-most-once: a lost message leaves the photo pending
        let published = match self.bus.publish(&outcome).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, payload = %outcome.payload(), "Failed to publish upload outcome");
                metrics::counter!("gallery.bus.publish_failed").increment(1);
                false
            }
        };

        match outcome {
            Outcome::UrlUpdate { .. } => JobOutcome::Transferred { published },
            Outcome::Delete { .. } => JobOutcome::TransferFailed { published },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{MemoryBlobTransfer, MockBlobTransfer};
    use crate::bus::{MemoryBus, MockNotificationBus};
    use crate::error::{StatusError, TransferError};
    use crate::status_store::{MemoryStatusStore, MockStatusStore};
    use mockall::{predicate, Sequence};

    fn endpoint() -> BlobEndpoint {
        BlobEndpoint::new(
            "https://{account}.blob.core.windows.net/{container}",
            "acct",
            "container",
        )
    }

    async fn job(photo_id: i64, name: &str) -> (std::path::PathBuf, UploadJob) {
        let path = std::env::temp_dir().join(format!("job-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, b"jpeg bytes").await.unwrap();
        let file = File::open(&path).await.unwrap();
        (path, UploadJob::new(photo_id, name, file))
    }

    #[tokio::test]
    async fn test_success_publishes_url_update() {
        let status = Arc::new(MemoryStatusStore::new());
        let blob = Arc::new(MemoryBlobTransfer::new());
        let bus = Arc::new(MemoryBus::new());
        let coordinator = UploadCoordinator::new(status.clone(), blob.clone(), bus.clone(), endpoint());
        let (path, job) = job(42, "a.jpg").await;

        let outcome = coordinator.run(job).await;

        assert_eq!(outcome, JobOutcome::Transferred { published: true });
        assert_eq!(blob.blob("a.jpg"), Some(b"jpeg bytes".to_vec()));
        assert_eq!(
            bus.published(),
            vec![Outcome::UrlUpdate {
                photo_id: 42,
                url: "https://acct.blob.core.windows.net/container/a.jpg".to_string(),
            }]
        );
        // Only the start is recorded here; terminal states belong to reconciliation
        assert_eq!(
            status.writes(),
            vec![(JobId::for_photo(42), UploadStatus::InProgress)]
        );

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_failure_publishes_delete() {
        let status = Arc::new(MemoryStatusStore::new());
        let blob = Arc::new(MemoryBlobTransfer::new());
        blob.fail_blob("a.jpg");
        let bus = Arc::new(MemoryBus::new());
        let coordinator = UploadCoordinator::new(status.clone(), blob, bus.clone(), endpoint());
        let (path, job) = job(42, "a.jpg").await;

        let outcome = coordinator.run(job).await;

        assert_eq!(outcome, JobOutcome::TransferFailed { published: true });
        assert_eq!(bus.published(), vec![Outcome::Delete { photo_id: 42 }]);
        assert_eq!(status.writes().len(), 1);

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_failure_aborts_before_transfer() {
        let mut status = MockStatusStore::new();
        status
            .expect_set_status()
            .times(1)
            .returning(|_, _| Err(StatusError::Backend("connection refused".to_string())));
        let mut blob = MockBlobTransfer::new();
        blob.expect_upload_file().never();
        let mut bus = MockNotificationBus::new();
        bus.expect_publish().never();

        let coordinator =
            UploadCoordinator::new(Arc::new(status), Arc::new(blob), Arc::new(bus), endpoint());
        let (path, job) = job(1, "a.jpg").await;

        assert_eq!(coordinator.run(job).await, JobOutcome::Aborted);

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let mut seq = Sequence::new();
        let mut status = MockStatusStore::new();
        let mut blob = MockBlobTransfer::new();
        let mut bus = MockNotificationBus::new();

        status
            .expect_set_status()
            .with(
                predicate::eq(JobId::for_photo(5)),
                predicate::eq(UploadStatus::InProgress),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        blob.expect_upload_file()
            .withf(|_, name| name.to_string() == "b.png")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| {
                Err(TransferError::Backend {
                    blob: name.to_string(),
                    message: "timeout".to_string(),
                })
            });
        bus.expect_publish()
            .with(predicate::eq(Outcome::Delete { photo_id: 5 }))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let coordinator =
            UploadCoordinator::new(Arc::new(status), Arc::new(blob), Arc::new(bus), endpoint());
        let (path, job) = job(5, "b.png").await;

        assert_eq!(
            coordinator.run(job).await,
            JobOutcome::TransferFailed { published: true }
        );

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let status = Arc::new(MemoryStatusStore::new());
        let bus = Arc::new(MemoryBus::new());
        bus.fail_publishes(true);
        let coordinator = UploadCoordinator::new(
            status.clone(),
            Arc::new(MemoryBlobTransfer::new()),
            bus.clone(),
            endpoint(),
        );
        let (path, job) = job(8, "c.jpg").await;

        assert_eq!(
            coordinator.run(job).await,
            JobOutcome::Transferred { published: false }
        );
        // The job stays IN_PROGRESS: the lost message is an accepted gap
        assert_eq!(
            status.writes(),
            vec![(JobId::for_photo(8), UploadStatus::InProgress)]
        );

        tokio::fs::remove_file(path).await.unwrap();
    }
}
