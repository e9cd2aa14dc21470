//! Job admission: the synchronous half of an upload.
//!
//! Admission registers the pending photo row, derives the job id and queues the
//! transfer. It returns as soon as the job is queued; the outcome is only
//! observable through the status accessor.
//!
//! A job the queue refuses is never run, so admission publishes a `delete`
//! for its row and lets the reconciliation listener remove it. Admission never
//! deletes rows itself.

use crate::bus::{NotificationBus, Outcome};
use crate::coordinator::UploadJob;
use crate::error::{AdmissionError, StoreError};
use crate::job::{ApiResponse, JobId, ResponseCode};
use crate::photo_store::{NewPhoto, PhotoRecord, PhotoStore};
use crate::queue::UploadQueue;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs::File;
use tracing::{error, info, instrument, warn};

/// An admitted upload
#[derive(Debug, Clone)]
pub struct Admission {
    /// The pending row, URL still empty
    pub photo: PhotoRecord,
    pub job_id: JobId,
}

/// Data of the admission response
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionData {
    pub photo: PhotoRecord,
    pub photo_upload_id: JobId,
}

impl From<Admission> for AdmissionData {
    fn from(admission: Admission) -> Self {
        Self {
            photo: admission.photo,
            photo_upload_id: admission.job_id,
        }
    }
}

/// Response envelope for an admission attempt
pub fn admission_response(
    result: Result<Admission, AdmissionError>,
) -> ApiResponse<Option<AdmissionData>> {
    match result {
        Ok(admission) => ApiResponse::new(ResponseCode::PhotoAddInProcess, Some(admission.into())),
        Err(AdmissionError::AlreadyExists { .. }) => {
            ApiResponse::new(ResponseCode::PhotoAlreadyExist, None)
        }
        Err(_) => ApiResponse::new(ResponseCode::InternalServerError, None),
    }
}

pub struct JobAdmission {
    store: Arc<dyn PhotoStore>,
    queue: Arc<UploadQueue>,
    bus: Arc<dyn NotificationBus>,
}

impl JobAdmission {
    pub fn new(
        store: Arc<dyn PhotoStore>,
        queue: Arc<UploadQueue>,
        bus: Arc<dyn NotificationBus>,
    ) -> Self {
        Self { store, queue, bus }
    }

    /// Admit an upload of `file` as `photo`. Never waits for queue space or
    /// for the transfer itself.
    #[instrument(skip(self, photo, file), fields(bucket_id = photo.bucket_id, name = %photo.name))]
    pub async fn admit(&self, photo: NewPhoto, file: File) -> Result<Admission, AdmissionError> {
        let record = self
            .store
            .create_pending_photo(&photo)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists { bucket_id, name } => {
                    AdmissionError::AlreadyExists { bucket_id, name }
                }
                StoreError::NotFound { id, .. } => AdmissionError::BucketNotFound(id),
                other => AdmissionError::Internal(other.to_string()),
            })?;

        let job = UploadJob::new(record.id, record.name.clone(), file);
        let job_id = job.job_id.clone();

        if let Err(e) = self.queue.submit(job) {
            warn!(photo_id = record.id, error = %e, "Upload queue refused job");
            metrics::counter!("gallery.jobs.rejected").increment(1);

            // No worker will ever report on this row
            let outcome = Outcome::Delete {
                photo_id: record.id,
            };
            if let Err(publish) = self.bus.publish(&outcome).await {
                error!(photo_id = record.id, error = %publish, "Failed to publish delete for refused job");
                metrics::counter!("gallery.bus.publish_failed").increment(1);
            }
            return Err(AdmissionError::Internal(e.to_string()));
        }

        info!(photo_id = record.id, job_id = %job_id, "Upload admitted");
        metrics::counter!("gallery.jobs.admitted").increment(1);

        Ok(Admission {
            photo: record,
            job_id,
        })
    }
}
