//! Wiring of the upload pipeline components.

use crate::admission::JobAdmission;
use crate::blob::{BlobEndpoint, BlobTransfer, BlockBlobTransfer};
use crate::bus::{KafkaBus, NotificationBus, Topics};
use crate::config::{Config, UploadConfig};
use crate::coordinator::UploadCoordinator;
use crate::error::StoreError;
use crate::listener::ReconciliationListener;
use crate::photo_store::{PgPhotoStore, PhotoRecord, PhotoStore};
use crate::queue::UploadQueue;
use crate::status_store::{RedisStatusStore, StatusAccessor, StatusStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// External collaborators the pipeline is built from
pub struct Components {
    pub store: Arc<dyn PhotoStore>,
    pub status: Arc<dyn StatusStore>,
    pub blob: Arc<dyn BlobTransfer>,
    pub bus: Arc<dyn NotificationBus>,
    pub endpoint: BlobEndpoint,
    pub topics: Topics,
}

/// Admission, worker pool, status accessor and listener sharing one set of
/// backends
pub struct UploadPipeline {
    admission: JobAdmission,
    accessor: StatusAccessor,
    listener: Arc<ReconciliationListener>,
    queue: Arc<UploadQueue>,
    store: Arc<dyn PhotoStore>,
}

impl UploadPipeline {
    /// Build the pipeline and start its worker pool
    pub fn assemble(components: Components, upload: &UploadConfig) -> Self {
        let Components {
            store,
            status,
            blob,
            bus,
            endpoint,
            topics,
        } = components;

        let coordinator = Arc::new(UploadCoordinator::new(
            status.clone(),
            blob,
            bus.clone(),
            endpoint,
        ));
        let queue = Arc::new(UploadQueue::start(
            coordinator,
            upload.workers,
            upload.queue_capacity,
        ));

        Self {
            admission: JobAdmission::new(store.clone(), queue.clone(), bus.clone()),
            accessor: StatusAccessor::new(status.clone()),
            listener: Arc::new(ReconciliationListener::new(store.clone(), status, topics)),
            queue,
            store,
        }
    }

    /// Connect every backend named in `config`
    pub async fn connect(config: &Config) -> Result<Self> {
        let (store, status) = connect_stores(config).await?;

        let bus = KafkaBus::new(&config.kafka).context("Failed to create notification bus")?;

        let blob = BlockBlobTransfer::s3(&config.blob).await;

        info!(
            account = %config.blob.account,
            container = %config.blob.container,
            "Upload pipeline backends connected"
        );

        Ok(Self::assemble(
            Components {
                store: Arc::new(store),
                status: Arc::new(status),
                blob: Arc::new(blob),
                bus: Arc::new(bus),
                endpoint: BlobEndpoint::from_config(&config.blob),
                topics: Topics::from_config(&config.kafka),
            },
            &config.upload,
        ))
    }

    /// Connect only what reconciliation needs. No worker pool is started, so
    /// a process built on this never admits uploads.
    pub async fn connect_listener(config: &Config) -> Result<ReconciliationListener> {
        let (store, status) = connect_stores(config).await?;

        info!("Reconciliation backends connected");

        Ok(ReconciliationListener::new(
            Arc::new(store),
            Arc::new(status),
            Topics::from_config(&config.kafka),
        ))
    }

    pub fn admission(&self) -> &JobAdmission {
        &self.admission
    }

    pub fn accessor(&self) -> &StatusAccessor {
        &self.accessor
    }

    pub fn listener(&self) -> Arc<ReconciliationListener> {
        self.listener.clone()
    }

    /// Fetch a photo row; pending rows have an empty URL
    pub async fn get_photo(&self, photo_id: i64) -> Result<Option<PhotoRecord>, StoreError> {
        self.store.get_photo(photo_id).await
    }

    /// Stop admitting and wait for queued uploads to finish
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

async fn connect_stores(config: &Config) -> Result<(PgPhotoStore, RedisStatusStore)> {
    let store = PgPhotoStore::new(&config.database)
        .await
        .context("Failed to initialize photo store")?;

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let status = RedisStatusStore::connect(&config.redis.url)
        .await
        .context("Failed to connect to status store")?;

    Ok((store, status))
}
