//! Reconciliation listener: applies published upload outcomes to the photo
//! store, then records the terminal status.
//!
//! Both topics feed one dispatch loop. The topic name selects how the payload
//! is parsed; everything after parsing is shared. Every received message is
//! committed once handled, whether it applied, failed or was malformed, so a
//! poison message cannot wedge the loop.

use crate::bus::{BusMessage, Outcome, Subscription, Topic, Topics};
use crate::error::MessageError;
use crate::job::{JobId, UploadStatus};
use crate::photo_store::PhotoStore;
use crate::status_store::StatusStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of handling one bus message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Photo store updated and the job's terminal status written
    Applied(UploadStatus),
    /// A store write failed; the job status was left as it was
    Failed,
    /// Payload or topic could not be understood
    Malformed,
}

pub struct ReconciliationListener {
    store: Arc<dyn PhotoStore>,
    status: Arc<dyn StatusStore>,
    topics: Topics,
}

impl ReconciliationListener {
    pub fn new(store: Arc<dyn PhotoStore>, status: Arc<dyn StatusStore>, topics: Topics) -> Self {
        Self {
            store,
            status,
            topics,
        }
    }

    /// Consume the subscription until cancelled or until the bus goes away
    pub async fn run<S: Subscription>(&self, mut subscription: S, cancel: CancellationToken) {
        info!(
            url_update = %self.topics.name(Topic::UrlUpdate),
            delete = %self.topics.name(Topic::Delete),
            "Starting reconciliation listener"
        );

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciliation listener cancelled");
                    break;
                }
                next = subscription.next_message() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!(error = %e, "Notification bus error");
                    metrics::counter!("gallery.bus.receive_failed").increment(1);
                    continue;
                }
                None => {
                    warn!("Notification bus closed, listener stopping");
                    break;
                }
            };

            self.handle(&message).await;

            if let Err(e) = subscription.commit(&message) {
                warn!(error = %e, offset = message.offset, "Failed to commit offset");
            }
        }
    }

    /// Handle one received message
    #[instrument(skip(self, message), fields(topic = %message.topic, offset = message.offset))]
    pub async fn handle(&self, message: &BusMessage) -> Reconciliation {
        let outcome = self
            .topics
            .resolve(&message.topic)
            .ok_or_else(|| MessageError::UnknownTopic(message.topic.clone()))
            .and_then(|topic| Outcome::parse(topic, &message.payload));

        match outcome {
            Ok(outcome) => self.apply(&outcome).await,
            Err(e) => {
                warn!(error = %e, payload = %message.payload, "Dropping malformed message");
                metrics::counter!("gallery.reconcile.malformed").increment(1);
                Reconciliation::Malformed
            }
        }
    }

    /// Apply an outcome. The store mutation always precedes the status write.
    pub async fn apply(&self, outcome: &Outcome) -> Reconciliation {
        let photo_id = outcome.photo_id();

        let terminal = match outcome {
            Outcome::UrlUpdate { url, .. } => match self.store.set_photo_url(photo_id, url).await {
                Ok(()) => UploadStatus::Succeeded,
                Err(e) => {
                    error!(photo_id, error = %e, "Failed to set photo url");
                    metrics::counter!("gallery.reconcile.failed").increment(1);
                    return Reconciliation::Failed;
                }
            },
            Outcome::Delete { .. } => match self.store.delete_photo(photo_id).await {
                Ok(()) => UploadStatus::Failed,
                // Redelivered delete: the row is already gone
                Err(e) if e.is_not_found() => {
                    debug!(photo_id, "Photo already deleted");
                    UploadStatus::Failed
                }
                Err(e) => {
                    error!(photo_id, error = %e, "Failed to delete pending photo");
                    metrics::counter!("gallery.reconcile.failed").increment(1);
                    return Reconciliation::Failed;
                }
            },
        };

        let job_id = JobId::for_photo(photo_id);
        if let Err(e) = self.status.set_status(&job_id, terminal).await {
            error!(job_id = %job_id, status = %terminal, error = %e, "Failed to record terminal status");
            metrics::counter!("gallery.reconcile.failed").increment(1);
            return Reconciliation::Failed;
        }

        info!(job_id = %job_id, status = %terminal, "Upload reconciled");
        metrics::counter!("gallery.reconcile.applied").increment(1);
        Reconciliation::Applied(terminal)
    }
}
