//! Error types shared by the upload pipeline components.

use thiserror::Error;

/// Errors from the durable photo/bucket store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("photo {name:?} already exists in bucket {bucket_id}")]
    AlreadyExists { bucket_id: i64, name: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors from the upload status store
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("status store error: {0}")]
    Backend(String),

    #[error("invalid status value {value:?} stored for {key}")]
    InvalidValue { key: String, value: String },
}

impl From<redis::RedisError> for StatusError {
    fn from(err: redis::RedisError) -> Self {
        StatusError::Backend(err.to_string())
    }
}

/// Errors from a blob transfer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to read upload source: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob service rejected {blob}: {message}")]
    Backend { blob: String, message: String },
}

/// Errors from the notification bus
#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("failed to receive message: {0}")]
    Receive(String),

    #[error("failed to commit message: {0}")]
    Commit(String),
}

/// Malformed payload received on a bus topic
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("message on unknown topic {0}")]
    UnknownTopic(String),

    #[error("invalid photo id in payload {0:?}")]
    InvalidPhotoId(String),

    #[error("url-update payload {0:?} has no url")]
    MissingUrl(String),
}

/// Errors surfaced synchronously by job admission
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("photo {name:?} already exists in bucket {bucket_id}")]
    AlreadyExists { bucket_id: i64, name: String },

    #[error("bucket {0} not found")]
    BucketNotFound(i64),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the upload queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("upload queue is full")]
    Full,
    #[error("upload queue is closed")]
    Closed,
}
