//! Upload status store and the read-only status accessor.
//!
//! Each job owns one key (its [`JobId`]) holding the integer code of its
//! [`UploadStatus`]. Keys are written without expiry and never deleted.

use crate::error::StatusError;
use crate::job::{JobId, UploadStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Key/value store holding per-job progress
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record `status` under the job key
    async fn set_status(&self, job_id: &JobId, status: UploadStatus) -> Result<(), StatusError>;

    /// Raw status code under the job key, `None` when the key is absent
    async fn status_code(&self, job_id: &JobId) -> Result<Option<i64>, StatusError>;
}

/// Read path used by clients polling upload progress
#[derive(Clone)]
pub struct StatusAccessor {
    store: Arc<dyn StatusStore>,
}

impl StatusAccessor {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Current status of a job. An absent key is `NotFound`, not an error.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn status(&self, job_id: &JobId) -> Result<UploadStatus, StatusError> {
        match self.store.status_code(job_id).await? {
            None => Ok(UploadStatus::NotFound),
            Some(code) => {
                UploadStatus::from_code(code).ok_or_else(|| StatusError::InvalidValue {
                    key: job_id.to_string(),
                    value: code.to_string(),
                })
            }
        }
    }
}

/// Redis-backed status store
pub struct RedisStatusStore {
    connection: ConnectionManager,
}

impl RedisStatusStore {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str) -> Result<Self, StatusError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Connected to Redis status store");

        Ok(Self { connection })
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn set_status(&self, job_id: &JobId, status: UploadStatus) -> Result<(), StatusError> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(job_id.as_str(), status.code())
            .await?;

        debug!(job_id = %job_id, status = %status, "Upload status written");
        Ok(())
    }

    async fn status_code(&self, job_id: &JobId) -> Result<Option<i64>, StatusError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(job_id.as_str()).await?;

        parse_stored(job_id, value)
    }
}

/// Stored values arrive as strings; the empty string is the absence sentinel.
fn parse_stored(job_id: &JobId, value: Option<String>) -> Result<Option<i64>, StatusError> {
    match value {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StatusError::InvalidValue {
                key: job_id.to_string(),
                value: raw,
            }),
    }
}

/// In-process status store
#[derive(Default)]
pub struct MemoryStatusStore {
    values: Mutex<HashMap<String, i64>>,
    writes: Mutex<Vec<(JobId, UploadStatus)>>,
    fail_writes: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every successful write, in order
    pub fn writes(&self) -> Vec<(JobId, UploadStatus)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set_status(&self, job_id: &JobId, status: UploadStatus) -> Result<(), StatusError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StatusError::Backend("status store unavailable".to_string()));
        }
        self.values
            .lock()
            .insert(job_id.as_str().to_string(), status.code());
        self.writes.lock().push((job_id.clone(), status));
        Ok(())
    }

    async fn status_code(&self, job_id: &JobId) -> Result<Option<i64>, StatusError> {
        Ok(self.values.lock().get(job_id.as_str()).copied())
    }
}
