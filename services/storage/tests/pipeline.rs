//! End-to-end upload scenarios over the in-process backends.

use gallery_storage::config::UploadConfig;
use gallery_storage::{
    status_response, BlobEndpoint, BusMessage, Components, JobId, MemoryBlobTransfer, MemoryBus,
    MemoryPhotoStore, MemoryStatusStore, NewPhoto, Outcome, PhotoStore, Reconciliation,
    StatusAccessor, Topics, UploadPipeline, UploadStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    pipeline: UploadPipeline,
    store: Arc<MemoryPhotoStore>,
    blob: Arc<MemoryBlobTransfer>,
    bus: Arc<MemoryBus>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
    files: Vec<PathBuf>,
}

impl Harness {
    fn start(first_photo_id: i64, buckets: &[i64]) -> Self {
        let store = Arc::new(MemoryPhotoStore::starting_at(first_photo_id));
        for bucket_id in buckets {
            store.add_bucket(*bucket_id);
        }
        let blob = Arc::new(MemoryBlobTransfer::new());
        let bus = Arc::new(MemoryBus::new());
        let subscription = bus.subscribe().unwrap();

        let pipeline = UploadPipeline::assemble(
            Components {
                store: store.clone(),
                status: Arc::new(MemoryStatusStore::new()),
                blob: blob.clone(),
                bus: bus.clone(),
                endpoint: BlobEndpoint::new(
                    "https://{account}.blob.core.windows.net/{container}",
                    "acct",
                    "container",
                ),
                topics: Topics::default(),
            },
            &UploadConfig::default(),
        );

        let cancel = CancellationToken::new();
        let listener = {
            let listener = pipeline.listener();
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(subscription, cancel).await })
        };

        Self {
            pipeline,
            store,
            blob,
            bus,
            cancel,
            listener,
            files: Vec::new(),
        }
    }

    async fn admit(&mut self, bucket_id: i64, name: &str) -> JobId {
        let path = std::env::temp_dir().join(format!("pipeline-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, format!("content of {name}")).await.unwrap();
        let file = File::open(&path).await.unwrap();
        self.files.push(path);

        let admission = self
            .pipeline
            .admission()
            .admit(
                NewPhoto {
                    auth_id: 1,
                    bucket_id,
                    name: name.to_string(),
                    tags: vec!["trip".to_string()],
                    description: String::new(),
                },
                file,
            )
            .await
            .unwrap();

        assert!(admission.photo.is_pending());
        admission.job_id
    }

    async fn stop(self) {
        self.pipeline.shutdown().await;
        self.cancel.cancel();
        self.listener.await.unwrap();
        for path in self.files {
            tokio::fs::remove_file(path).await.unwrap();
        }
    }
}

async fn wait_for_terminal(accessor: &StatusAccessor, job_id: &JobId) -> UploadStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = accessor.status(job_id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal status")
}

#[tokio::test]
async fn test_successful_upload_is_reconciled() {
    let mut harness = Harness::start(42, &[7]);

    let job_id = harness.admit(7, "a.jpg").await;
    assert_eq!(job_id.as_str(), "photo_42");
    assert_eq!(harness.store.bucket_size(7).await.unwrap(), 1);

    let status = wait_for_terminal(harness.pipeline.accessor(), &job_id).await;
    assert_eq!(status, UploadStatus::Succeeded);
    assert_eq!(status.code(), 0);

    let published: Vec<String> = harness.bus.published().iter().map(Outcome::payload).collect();
    assert_eq!(
        published,
        vec!["42-https://acct.blob.core.windows.net/container/a.jpg".to_string()]
    );

    let photo = harness.pipeline.get_photo(42).await.unwrap().unwrap();
    assert_eq!(photo.url, "https://acct.blob.core.windows.net/container/a.jpg");
    assert_eq!(harness.blob.blob("a.jpg"), Some(b"content of a.jpg".to_vec()));
    assert_eq!(status_response(job_id, status).code, 4003);

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_upload_deletes_photo() {
    let mut harness = Harness::start(42, &[7]);
    harness.blob.fail_blob("a.jpg");

    let job_id = harness.admit(7, "a.jpg").await;

    let status = wait_for_terminal(harness.pipeline.accessor(), &job_id).await;
    assert_eq!(status, UploadStatus::Failed);
    assert_eq!(status.code(), -1);

    let published: Vec<String> = harness.bus.published().iter().map(Outcome::payload).collect();
    assert_eq!(published, vec!["42".to_string()]);
    assert!(harness.pipeline.get_photo(42).await.unwrap().is_none());
    // Admission-time count is kept even though the upload failed
    assert_eq!(harness.store.bucket_size(7).await.unwrap(), 1);
    assert_eq!(status_response(job_id, status).code, 4004);

    harness.stop().await;
}

#[tokio::test]
async fn test_replayed_delete_keeps_failed_status() {
    let mut harness = Harness::start(42, &[7]);
    harness.blob.fail_blob("a.jpg");

    let job_id = harness.admit(7, "a.jpg").await;
    wait_for_terminal(harness.pipeline.accessor(), &job_id).await;

    let replay = BusMessage {
        topic: "delete".to_string(),
        payload: "42".to_string(),
        partition: 0,
        offset: 99,
    };
    let result = harness.pipeline.listener().handle(&replay).await;

    assert_eq!(result, Reconciliation::Applied(UploadStatus::Failed));
    assert_eq!(
        harness.pipeline.accessor().status(&job_id).await.unwrap(),
        UploadStatus::Failed
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let harness = Harness::start(1, &[]);

    let job_id = JobId::for_photo(12345);
    let status = harness.pipeline.accessor().status(&job_id).await.unwrap();

    assert_eq!(status, UploadStatus::NotFound);
    assert_eq!(status.code(), -2);
    assert_eq!(status_response(job_id, status).code, 4005);

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_jobs_reflect_their_own_outcome() {
    let mut harness = Harness::start(1, &[1, 2]);
    harness.blob.fail_blob("broken.jpg");

    let good = harness.admit(1, "good.jpg").await;
    let broken = harness.admit(2, "broken.jpg").await;

    let accessor = harness.pipeline.accessor();
    let (good_status, broken_status) = tokio::join!(
        wait_for_terminal(accessor, &good),
        wait_for_terminal(accessor, &broken)
    );

    assert_eq!(good_status, UploadStatus::Succeeded);
    assert_eq!(broken_status, UploadStatus::Failed);

    let good_id = good.photo_id().unwrap();
    let broken_id = broken.photo_id().unwrap();
    assert!(!harness
        .pipeline
        .get_photo(good_id)
        .await
        .unwrap()
        .unwrap()
        .is_pending());
    assert!(harness.pipeline.get_photo(broken_id).await.unwrap().is_none());

    harness.stop().await;
}
