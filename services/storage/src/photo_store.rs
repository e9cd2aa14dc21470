use crate::config::DatabaseConfig;
use crate::error::StoreError;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument};

/// `state` of a live photo row
pub const PHOTO_STATE_ACTIVE: i16 = 1;

const TAG_SEPARATOR: &str = ";";

/// Stored photo row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct PhotoRecord {
    pub id: i64,
    pub auth_id: i64,
    pub bucket_id: i64,
    /// Unique among live photos of the bucket; also the blob name
    pub name: String,
    /// Tags joined with `;`
    pub tag: String,
    /// Empty until reconciliation assigns the blob URL
    pub url: String,
    pub description: String,
    pub state: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoRecord {
    /// A pending photo exists but its upload has not been reconciled
    pub fn is_pending(&self) -> bool {
        self.url.is_empty()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.tag
            .split(TAG_SEPARATOR)
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Validated descriptor of a photo to admit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPhoto {
    pub auth_id: i64,
    pub bucket_id: i64,
    pub name: String,
    pub tags: Vec<String>,
    pub description: String,
}

impl NewPhoto {
    pub fn tag_string(&self) -> String {
        self.tags.join(TAG_SEPARATOR)
    }
}

/// Durable record layer touched by the upload pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// In one transaction: reject a duplicate (bucket, name), insert the row
    /// with an empty URL, and increment the bucket's size
    async fn create_pending_photo(&self, photo: &NewPhoto) -> Result<PhotoRecord, StoreError>;

    /// Set the URL of a photo row
    async fn set_photo_url(&self, photo_id: i64, url: &str) -> Result<(), StoreError>;

    /// Delete a photo row
    async fn delete_photo(&self, photo_id: i64) -> Result<(), StoreError>;

    async fn get_photo(&self, photo_id: i64) -> Result<Option<PhotoRecord>, StoreError>;

    /// Number of admitted photos counted on a bucket
    async fn bucket_size(&self, bucket_id: i64) -> Result<i64, StoreError>;
}

const PHOTO_COLUMNS: &str =
    "id, auth_id, bucket_id, name, tag, url, description, state, created_at, updated_at";

/// PostgreSQL-backed photo store
pub struct PgPhotoStore {
    pool: PgPool,
}

impl PgPhotoStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl PhotoStore for PgPhotoStore {
    #[instrument(skip(self, photo), fields(bucket_id = photo.bucket_id, name = %photo.name))]
    async fn create_pending_photo(&self, photo: &NewPhoto) -> Result<PhotoRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM photo WHERE bucket_id = $1 AND name = $2 AND state = $3 FOR UPDATE",
        )
        .bind(photo.bucket_id)
        .bind(&photo.name)
        .bind(PHOTO_STATE_ACTIVE)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            return Err(already_exists(photo));
        }

        let insert = format!(
            r#"
            INSERT INTO photo (auth_id, bucket_id, name, tag, url, description, state)
            VALUES ($1, $2, $3, $4, '', $5, $6)
            RETURNING {PHOTO_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, PhotoRecord>(&insert)
            .bind(photo.auth_id)
            .bind(photo.bucket_id)
            .bind(&photo.name)
            .bind(photo.tag_string())
            .bind(&photo.description)
            .bind(PHOTO_STATE_ACTIVE)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match e {
                // A concurrent admission won the race for the name
                sqlx::Error::Database(ref db) if db.is_unique_violation() => already_exists(photo),
                sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                    StoreError::NotFound {
                        entity: "bucket",
                        id: photo.bucket_id,
                    }
                }
                other => StoreError::Database(other),
            })?;

        let updated = sqlx::query("UPDATE bucket SET size = size + 1, updated_at = NOW() WHERE id = $1")
            .bind(photo.bucket_id)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound {
                entity: "bucket",
                id: photo.bucket_id,
            });
        }

        tx.commit().await?;

        debug!(photo_id = record.id, "Pending photo created");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn set_photo_url(&self, photo_id: i64, url: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE photo SET url = $2, updated_at = NOW() WHERE id = $1")
            .bind(photo_id)
            .bind(url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(photo_not_found(photo_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_photo(&self, photo_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM photo WHERE id = $1")
            .bind(photo_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(photo_not_found(photo_id));
        }
        Ok(())
    }

    async fn get_photo(&self, photo_id: i64) -> Result<Option<PhotoRecord>, StoreError> {
        let query = format!("SELECT {PHOTO_COLUMNS} FROM photo WHERE id = $1");
        let photo = sqlx::query_as::<_, PhotoRecord>(&query)
            .bind(photo_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(photo)
    }

    async fn bucket_size(&self, bucket_id: i64) -> Result<i64, StoreError> {
        let size: Option<(i64,)> = sqlx::query_as("SELECT size::BIGINT FROM bucket WHERE id = $1")
            .bind(bucket_id)
            .fetch_optional(&self.pool)
            .await?;

        size.map(|(size,)| size).ok_or(StoreError::NotFound {
            entity: "bucket",
            id: bucket_id,
        })
    }
}

fn already_exists(photo: &NewPhoto) -> StoreError {
    StoreError::AlreadyExists {
        bucket_id: photo.bucket_id,
        name: photo.name.clone(),
    }
}

fn photo_not_found(photo_id: i64) -> StoreError {
    StoreError::NotFound {
        entity: "photo",
        id: photo_id,
    }
}

#[derive(Default)]
struct MemoryState {
    photos: BTreeMap<i64, PhotoRecord>,
    buckets: HashMap<i64, i64>,
    next_id: i64,
}

/// In-process photo store
pub struct MemoryPhotoStore {
    state: Mutex<MemoryState>,
    fail_updates: AtomicBool,
}

impl MemoryPhotoStore {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Store whose next photo id is `next_id`
    pub fn starting_at(next_id: i64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id,
                ..Default::default()
            }),
            fail_updates: AtomicBool::new(false),
        }
    }

    pub fn add_bucket(&self, bucket_id: i64) {
        self.state.lock().buckets.entry(bucket_id).or_insert(0);
    }

    /// Make URL updates and deletes fail with a database error
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

impl Default for MemoryPhotoStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn create_pending_photo(&self, photo: &NewPhoto) -> Result<PhotoRecord, StoreError> {
        let mut state = self.state.lock();

        let duplicate = state.photos.values().any(|p| {
            p.bucket_id == photo.bucket_id && p.name == photo.name && p.state == PHOTO_STATE_ACTIVE
        });
        if duplicate {
            return Err(already_exists(photo));
        }
        if !state.buckets.contains_key(&photo.bucket_id) {
            return Err(StoreError::NotFound {
                entity: "bucket",
                id: photo.bucket_id,
            });
        }

        let now = Utc::now();
        let record = PhotoRecord {
            id: state.next_id,
            auth_id: photo.auth_id,
            bucket_id: photo.bucket_id,
            name: photo.name.clone(),
            tag: photo.tag_string(),
            url: String::new(),
            description: photo.description.clone(),
            state: PHOTO_STATE_ACTIVE,
            created_at: now,
            updated_at: now,
        };

        state.next_id += 1;
        state.photos.insert(record.id, record.clone());
        if let Some(size) = state.buckets.get_mut(&photo.bucket_id) {
            *size += 1;
        }

        Ok(record)
    }

    async fn set_photo_url(&self, photo_id: i64, url: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let photo = state
            .photos
            .get_mut(&photo_id)
            .ok_or_else(|| photo_not_found(photo_id))?;

        photo.url = url.to_string();
        photo.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_photo(&self, photo_id: i64) -> Result<(), StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .photos
            .remove(&photo_id)
            .map(|_| ())
            .ok_or_else(|| photo_not_found(photo_id))
    }

    async fn get_photo(&self, photo_id: i64) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self.state.lock().photos.get(&photo_id).cloned())
    }

    async fn bucket_size(&self, bucket_id: i64) -> Result<i64, StoreError> {
        self.state
            .lock()
            .buckets
            .get(&bucket_id)
            .copied()
            .ok_or(StoreError::NotFound {
                entity: "bucket",
                id: bucket_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_photo(bucket_id: i64, name: &str) -> NewPhoto {
        NewPhoto {
            auth_id: 1,
            bucket_id,
            name: name.to_string(),
            tags: vec!["beach".to_string(), "2024".to_string()],
            description: "holiday".to_string(),
        }
    }

    #[test]
    fn test_photo_url_column_is_unbounded() {
        let migration = include_str!("../migrations/20240101000000_create_gallery.sql");
        let url_column = migration
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("url "))
            .unwrap();

        assert!(url_column.contains("TEXT"), "{url_column}");
    }

    #[test]
    fn test_tag_round_trip() {
        let photo = new_photo(1, "a.jpg");
        assert_eq!(photo.tag_string(), "beach;2024");

        let record = PhotoRecord {
            id: 1,
            auth_id: 1,
            bucket_id: 1,
            name: "a.jpg".to_string(),
            tag: "beach;2024".to_string(),
            url: String::new(),
            description: String::new(),
            state: PHOTO_STATE_ACTIVE,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(record.tags(), vec!["beach", "2024"]);
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn test_create_pending_photo_increments_bucket() {
        let store = MemoryPhotoStore::starting_at(42);
        store.add_bucket(7);

        let record = store
            .create_pending_photo(&new_photo(7, "a.jpg"))
            .await
            .unwrap();

        assert_eq!(record.id, 42);
        assert!(record.is_pending());
        assert_eq!(record.state, PHOTO_STATE_ACTIVE);
        assert_eq!(store.bucket_size(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = MemoryPhotoStore::new();
        store.add_bucket(7);
        store
            .create_pending_photo(&new_photo(7, "a.jpg"))
            .await
            .unwrap();

        let err = store
            .create_pending_photo(&new_photo(7, "a.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { bucket_id: 7, .. }));
        assert_eq!(store.bucket_size(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_name_in_other_bucket_allowed() {
        let store = MemoryPhotoStore::new();
        store.add_bucket(1);
        store.add_bucket(2);

        store.create_pending_photo(&new_photo(1, "a.jpg")).await.unwrap();
        store.create_pending_photo(&new_photo(2, "a.jpg")).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_bucket_creates_nothing() {
        let store = MemoryPhotoStore::new();

        let err = store
            .create_pending_photo(&new_photo(9, "a.jpg"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_photo(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_photo_is_not_found() {
        let store = MemoryPhotoStore::new();

        let err = store.delete_photo(5).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_set_url() {
        let store = MemoryPhotoStore::new();
        store.add_bucket(1);
        let record = store.create_pending_photo(&new_photo(1, "a.jpg")).await.unwrap();

        store.set_photo_url(record.id, "https://x/a.jpg").await.unwrap();

        let stored = store.get_photo(record.id).await.unwrap().unwrap();
        assert_eq!(stored.url, "https://x/a.jpg");
        assert!(!stored.is_pending());
    }
}
