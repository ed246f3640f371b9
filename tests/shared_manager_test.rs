use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use upload_queue::core::ProgressFn;
use upload_queue::{FileInput, Transfer, TransferError, TransferResponse, UploadManager};

struct NoopTransfer;

#[async_trait]
impl Transfer for NoopTransfer {
    async fn upload(
        &self,
        _file: &FileInput,
        _cancel: CancellationToken,
        _on_progress: ProgressFn,
    ) -> Result<TransferResponse, TransferError> {
        Ok(TransferResponse::default())
    }
}

// the shared instance is process-wide, so it gets a test binary of its own
#[tokio::test]
async fn test_get_or_create_returns_one_instance() {
    let first = UploadManager::get_or_create(
        || UploadManager::builder().concurrent_limit(2).transfer(Arc::new(NoopTransfer)),
        None,
    )
    .await
    .unwrap();
    assert_eq!(first.stats().await.unwrap().concurrent_limit, 2);

    let second = UploadManager::get_or_create(
        || panic!("the shared manager must only be built once"),
        Some(4),
    )
    .await
    .unwrap();

    // both handles reach the same worker
    assert_eq!(first.stats().await.unwrap().concurrent_limit, 4);
    assert_eq!(second.stats().await.unwrap().concurrent_limit, 4);

    first.set_online(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!second.stats().await.unwrap().online);
}
