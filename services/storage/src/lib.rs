//! Gallery Storage Service
//!
//! Asynchronous photo upload pipeline for the photo gallery backend. Admission
//! registers a pending photo row and returns a job id at once; the transfer to
//! blob storage runs in the background, and its outcome flows back over the
//! notification bus to a listener that reconciles the photo row and records
//! the job's terminal status.
//!
//! ## Features
//!
//! - **Non-blocking admission**: the caller gets `photo_<id>` as soon as the
//!   row exists and the job is queued
//! - **Block uploads**: fixed-size blocks with bounded parallelism, single put
//!   for small files
//! - **Pollable status**: `NOT_FOUND`, `IN_PROGRESS`, `SUCCEEDED` or `FAILED`
//!   per job, read from Redis
//! - **Idempotent reconciliation**: replayed `url-update` and `delete`
//!   messages are safe
//!
//! ## Architecture
//!
//! ```text
//!  Admission                 Worker pool                Blob storage
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ Job          │─────────▶│ Upload       │─────────▶│ {container}/ │
//! │ Admission    │  queue   │ Coordinator  │          │   {name}     │
//! └──────────────┘          └──────────────┘          └──────────────┘
//!        │                     │        │
//!        ▼                     │        ▼
//! ┌──────────────┐             │  ┌──────────────┐
//! │ PostgreSQL   │             │  │ Kafka        │
//! │ photo/bucket │             │  │ url-update   │
//! └──────────────┘             │  │ delete       │
//!        ▲                     │  └──────────────┘
//!        │                     ▼        │
//!        │              ┌──────────────┐│
//!        │              │ Redis        ││
//!        │              │ photo_<id>   ││
//!        │              └──────────────┘│
//!        │                     ▲        ▼
//!        │              ┌──────────────────────┐
//!        └──────────────│ Reconciliation       │
//!                       │ Listener             │
//!                       └──────────────────────┘
//! ```
//!
//! ## Binary
//!
//! The `gallery-storage` binary runs only the reconciliation listener. It
//! starts no worker pool and admits nothing; a process that accepts uploads
//! builds an [`UploadPipeline`] and calls [`JobAdmission::admit`].

pub mod admission;
pub mod blob;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod listener;
pub mod photo_store;
pub mod pipeline;
pub mod queue;
pub mod status_store;

pub use admission::{admission_response, Admission, AdmissionData, JobAdmission};
pub use blob::{
    BlobEndpoint, BlobTransfer, BlockBlobTransfer, BlockStore, MemoryBlobTransfer, S3BlockStore,
    UploadedBlock,
};
pub use bus::{
    BusMessage, KafkaBus, KafkaSubscription, MemoryBus, MemorySubscription, NotificationBus,
    Outcome, Subscription, Topic, Topics,
};
pub use config::Config;
pub use coordinator::{JobOutcome, UploadCoordinator, UploadJob};
pub use error::{
    AdmissionError, BusError, MessageError, QueueError, StatusError, StoreError, TransferError,
};
pub use job::{status_response, ApiResponse, JobId, ResponseCode, StatusPollData, UploadStatus};
pub use listener::{Reconciliation, ReconciliationListener};
pub use photo_store::{MemoryPhotoStore, NewPhoto, PgPhotoStore, PhotoRecord, PhotoStore};
pub use pipeline::{Components, UploadPipeline};
pub use queue::UploadQueue;
pub use status_store::{MemoryStatusStore, RedisStatusStore, StatusAccessor, StatusStore};
