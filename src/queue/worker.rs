use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::core::{
    ErrorCategory, FileInput, ItemCallbacks, ItemError, MediaRecord, Progress, ProgressFn,
    QueueStore, RegistrationContext, Transfer, TransferError, UploadId, UploadItem, UploadResults,
};
use crate::utils::item_error;
use super::progress::ProgressEstimator;

pub(crate) const PAYLOAD_MISSING: &str = "payload_missing";
pub(crate) const REGISTRATION_FAILED: &str = "registration_failed";

/// How one pipeline run ended.
#[derive(Debug)]
pub(crate) enum PipelineOutcome {
    Completed {
        record: MediaRecord,
        speed: f64,
        duration: Duration,
    },
    /// The token fired before registration started
    Cancelled,
    Failed {
        error: ItemError,
        /// Transfer failures go through the retry policy, everything else is terminal
        retryable: bool,
    },
}

const TRANSFERRING: u8 = 0;
const REGISTERING: u8 = 1;
const INTERRUPTED: u8 = 2;

/// Decides who wins when a pause or cancel races with the end of a transfer.
/// Once registration has begun the item can no longer be interrupted.
#[derive(Debug, Clone, Default)]
pub(crate) struct PipelinePhase(Arc<AtomicU8>);

impl PipelinePhase {
    /// Claimed by the pipeline after a successful transfer.
    pub fn begin_registration(&self) -> bool {
        self.0
            .compare_exchange(TRANSFERRING, REGISTERING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claimed by the manager on pause or cancel.
    pub fn interrupt(&self) -> bool {
        self.0
            .compare_exchange(TRANSFERRING, INTERRUPTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst) == INTERRUPTED
    }
}

/// Runs one item: payload load, transfer, registration, hooks.
pub(crate) struct UploadWorker {
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) transfer: Arc<dyn Transfer>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) phase: PipelinePhase,
    pub(crate) progress_window: usize,
}

impl UploadWorker {
    pub async fn run(
        self,
        item: UploadItem,
        callbacks: ItemCallbacks,
        progress_tx: mpsc::UnboundedSender<(UploadId, Progress)>,
    ) -> PipelineOutcome {
        let upload_id = item.id;

        let data = match self.store.load_payload(&item.file_ref).await {
            Ok(data) => data,
            Err(err) => {
                warn!(%upload_id, error = %err, "payload could not be loaded");
                return PipelineOutcome::Failed {
                    error: ItemError::new(ErrorCategory::Unknown, err.to_string()).with_code(PAYLOAD_MISSING),
                    retryable: false,
                };
            }
        };
        let file = FileInput::new(item.filename.clone(), item.mime_type.clone(), data);

        let estimator = Arc::new(Mutex::new(ProgressEstimator::new(item.size, self.progress_window)));
        let on_progress: ProgressFn = {
            let estimator = estimator.clone();
            Arc::new(move |loaded, total| {
                let snapshot = {
                    let mut estimator = estimator.lock().unwrap_or_else(|e| e.into_inner());
                    if total > 0 {
                        estimator.set_total(total);
                    }
                    estimator.record(loaded);
                    estimator.snapshot()
                };
                let _ = progress_tx.send((upload_id, snapshot));
            })
        };

        debug!(%upload_id, size = item.size, "transfer started");
        let result = tokio::select! {
            result = self.transfer.upload(&file, self.cancellation_token.clone(), on_progress) => result,
            _ = self.cancellation_token.cancelled() => Err(TransferError::Cancelled),
        };

        let response = match result {
            Ok(response) => response,
            Err(_) if self.cancellation_token.is_cancelled() => return PipelineOutcome::Cancelled,
            Err(TransferError::Cancelled) => return PipelineOutcome::Cancelled,
            Err(err) => {
                debug!(%upload_id, error = %err, "transfer failed");
                return PipelineOutcome::Failed {
                    error: item_error(&err),
                    retryable: true,
                };
            }
        };

        // a pause that raced with the last chunk still wins
        if !self.phase.begin_registration() {
            return PipelineOutcome::Cancelled;
        }

        let (speed, duration) = {
            let estimator = estimator.lock().unwrap_or_else(|e| e.into_inner());
            (estimator.average_speed(), estimator.elapsed())
        };

        let context = RegistrationContext::for_item(&item);
        let record = match callbacks.registrar.register(&response, &file, &context).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%upload_id, error = %err, "media registration failed");
                let error = ItemError::new(ErrorCategory::Server, err.to_string())
                    .with_code(REGISTRATION_FAILED)
                    .with_status(err.status());

                if let Some(hook) = &callbacks.on_complete {
                    let results = UploadResults {
                        successful: Vec::new(),
                        failed: vec![error.clone()],
                    };
                    if let Err(err) = hook.on_complete(&results).await {
                        warn!(%upload_id, error = %err, "completion hook failed");
                    }
                }

                return PipelineOutcome::Failed { error, retryable: false };
            }
        };

        if let Some(reload) = &callbacks.reload {
            if let Err(err) = reload.reload().await {
                warn!(%upload_id, error = %err, "reload hook failed");
            }
        }

        if let Some(hook) = &callbacks.on_complete {
            let results = UploadResults {
                successful: vec![record.clone()],
                failed: Vec::new(),
            };
            if let Err(err) = hook.on_complete(&results).await {
                warn!(%upload_id, error = %err, "completion hook failed");
            }
        }

        PipelineOutcome::Completed { record, speed, duration }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use async_trait::async_trait;
    use crate::core::{
        MediaRegistrar, ReloadHook, TransferResponse, UploadRequest,
    };
    use crate::store::MemoryQueueStore;
    use super::*;

    struct StaticTransfer {
        result: Result<TransferResponse, TransferError>,
    }

    #[async_trait]
    impl Transfer for StaticTransfer {
        async fn upload(
            &self,
            file: &FileInput,
            _cancel: CancellationToken,
            on_progress: ProgressFn,
        ) -> Result<TransferResponse, TransferError> {
            on_progress(file.size() / 2, file.size());
            on_progress(file.size(), file.size());
            self.result.clone()
        }
    }

    struct CountingRegistrar {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MediaRegistrar for CountingRegistrar {
        async fn register(
            &self,
            response: &TransferResponse,
            _file: &FileInput,
            context: &RegistrationContext,
        ) -> Result<MediaRecord, TransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransferError::from_status(500, "registration down"));
            }
            Ok(MediaRecord::from_value(serde_json::json!({
                "id": response.file_id().unwrap_or_default(),
                "set": context.set_id,
            })))
        }
    }

    struct CountingReload(AtomicUsize);

    #[async_trait]
    impl ReloadHook for CountingReload {
        async fn reload(&self) -> Result<(), TransferError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TransferError::other("view gone"))
        }
    }

    async fn stored_item(store: &MemoryQueueStore) -> UploadItem {
        let file = FileInput::new("a.jpg", "image/jpeg", vec![7u8; 1000]);
        let request = UploadRequest::new("collection", "col-1").with_set("set-1");
        let item = UploadItem::new(&file, &request, 0);
        store.save(&item, file.data.clone()).await.unwrap();
        item
    }

    fn worker(store: Arc<MemoryQueueStore>, result: Result<TransferResponse, TransferError>) -> UploadWorker {
        UploadWorker {
            store,
            transfer: Arc::new(StaticTransfer { result }),
            cancellation_token: CancellationToken::new(),
            phase: PipelinePhase::default(),
            progress_window: 10,
        }
    }

    #[tokio::test]
    async fn test_pipeline_completes_and_reports_progress() {
        let store = Arc::new(MemoryQueueStore::new(0));
        let item = stored_item(&store).await;
        let registrar = Arc::new(CountingRegistrar { calls: AtomicUsize::new(0), fail: false });
        let reload = Arc::new(CountingReload(AtomicUsize::new(0)));
        let callbacks = ItemCallbacks::new(registrar.clone()).with_reload(reload.clone());
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let response = TransferResponse { data: serde_json::json!({ "id": "f-1" }) };
        let outcome = worker(store, Ok(response)).run(item.clone(), callbacks, progress_tx).await;

        match outcome {
            PipelineOutcome::Completed { record, .. } => assert_eq!(record.id, "f-1"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
        // a failing reload hook does not fail the item
        assert_eq!(reload.0.load(Ordering::SeqCst), 1);

        let (first_id, first) = progress_rx.recv().await.unwrap();
        assert_eq!(first_id, item.id);
        assert_eq!(first.loaded, 500);
        let (_, last) = progress_rx.recv().await.unwrap();
        assert_eq!(last.percentage, 100.0);
    }

    #[tokio::test]
    async fn test_transfer_failure_is_retryable() {
        let store = Arc::new(MemoryQueueStore::new(0));
        let item = stored_item(&store).await;
        let registrar = Arc::new(CountingRegistrar { calls: AtomicUsize::new(0), fail: false });
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let outcome = worker(store, Err(TransferError::from_status(503, "unavailable")))
            .run(item, ItemCallbacks::new(registrar.clone()), progress_tx)
            .await;

        match outcome {
            PipelineOutcome::Failed { error, retryable } => {
                assert!(retryable);
                assert_eq!(error.category, ErrorCategory::Server);
                assert_eq!(error.status, Some(503));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registration_failure_is_terminal() {
        let store = Arc::new(MemoryQueueStore::new(0));
        let item = stored_item(&store).await;
        let registrar = Arc::new(CountingRegistrar { calls: AtomicUsize::new(0), fail: true });
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let outcome = worker(store, Ok(TransferResponse::default()))
            .run(item, ItemCallbacks::new(registrar.clone()), progress_tx)
            .await;

        match outcome {
            PipelineOutcome::Failed { error, retryable } => {
                assert!(!retryable);
                assert_eq!(error.category, ErrorCategory::Server);
                assert_eq!(error.code.as_deref(), Some(REGISTRATION_FAILED));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_payload_fails_unknown() {
        let store = Arc::new(MemoryQueueStore::new(0));
        let file = FileInput::new("lost.jpg", "image/jpeg", vec![1u8; 10]);
        let item = UploadItem::new(&file, &UploadRequest::new("collection", "col-1"), 0);
        let registrar = Arc::new(CountingRegistrar { calls: AtomicUsize::new(0), fail: false });
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let outcome = worker(store, Ok(TransferResponse::default()))
            .run(item, ItemCallbacks::new(registrar), progress_tx)
            .await;

        match outcome {
            PipelineOutcome::Failed { error, retryable } => {
                assert!(!retryable);
                assert_eq!(error.category, ErrorCategory::Unknown);
                assert_eq!(error.code.as_deref(), Some(PAYLOAD_MISSING));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = Arc::new(MemoryQueueStore::new(0));
        let item = stored_item(&store).await;
        let registrar = Arc::new(CountingRegistrar { calls: AtomicUsize::new(0), fail: false });
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let worker = worker(store, Ok(TransferResponse::default()));
        assert!(worker.phase.interrupt());
        worker.cancellation_token.cancel();
        let outcome = worker.run(item, ItemCallbacks::new(registrar.clone()), progress_tx).await;

        assert!(matches!(outcome, PipelineOutcome::Cancelled));
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_phase_is_claimed_once() {
        let phase = PipelinePhase::default();
        assert!(phase.begin_registration());
        assert!(!phase.interrupt());
        assert!(!phase.is_interrupted());

        let phase = PipelinePhase::default();
        assert!(phase.interrupt());
        assert!(phase.is_interrupted());
        assert!(!phase.begin_registration());
    }
}
