use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use crate::config::QueueConfig;
use crate::core::{
    Admission, FileInput, HistoryEntry, HistoryStore, ItemCallbacks, ManagerCommand, QueueError,
    QueueStats, QueueStore, Result, Transfer, UploadEvent, UploadId, UploadItem, UploadRequest,
};
use crate::store::{MemoryHistoryStore, MemoryQueueStore};
use super::batch::ActiveBatches;
use super::dedup;
use super::manager_worker::{UploadManagerWorker, WorkerParts};
use super::resolver::CallbackResolver;

static SHARED: OnceLock<UploadManager> = OnceLock::new();

/// Cloneable front of the upload queue. Every call is a command to the single
/// worker task that owns the queue state.
#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    batches: ActiveBatches,
}

/// The manager together with the task running its worker.
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    /// Stops the worker and waits for it. In-flight items are aborted and
    /// persisted as `pending`.
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.manager.command_tx.send(ManagerCommand::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        drop(self.manager);

        self.worker_handle
            .await
            .map_err(|err| QueueError::Internal(format!("Worker panic: {}", err)))
    }
}

/// Assembles an [`UploadManager`]. Only the transfer is mandatory; stores
/// default to in-memory ones.
#[derive(Default)]
pub struct UploadManagerBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn QueueStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    transfer: Option<Arc<dyn Transfer>>,
    resolver: CallbackResolver,
}

impl UploadManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn concurrent_limit(mut self, limit: usize) -> Self {
        self.config.concurrent_limit = limit.max(1);
        self
    }

    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn resolver(mut self, resolver: CallbackResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Spawns the worker; must be called inside a tokio runtime.
    pub fn build(self) -> Result<UploadManagerHandle> {
        let transfer = self
            .transfer
            .ok_or_else(|| QueueError::invalid_parameter("a transfer implementation is required"))?;
        if self.config.concurrent_limit == 0 {
            return Err(QueueError::invalid_parameter("concurrent limit must be at least 1"));
        }

        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (event_tx, _) = broadcast::channel(self.config.event_capacity.max(1));

        let parts = WorkerParts {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryQueueStore::new(0))),
            history: self.history.unwrap_or_else(|| Arc::new(MemoryHistoryStore::new())),
            transfer,
            resolver: self.resolver,
            config: self.config,
        };

        let worker_handle = tokio::spawn(UploadManagerWorker::run(parts, command_rx, event_tx.clone()));

        let manager = UploadManager {
            command_tx,
            event_tx,
            batches: ActiveBatches::new(),
        };

        Ok(UploadManagerHandle {
            manager,
            worker_handle,
        })
    }
}

impl UploadManager {
    pub fn builder() -> UploadManagerBuilder {
        UploadManagerBuilder::new()
    }

    /// Process-wide instance for composition roots.
    ///
    /// The first call builds the manager from `init`; later calls return the
    /// same instance and only apply `concurrent_limit` when given.
    pub async fn get_or_create<F>(init: F, concurrent_limit: Option<usize>) -> Result<UploadManager>
    where
        F: FnOnce() -> UploadManagerBuilder,
    {
        let manager = match SHARED.get() {
            Some(manager) => manager.clone(),
            None => {
                let handle = init().build()?;
                // a racing caller may have won; our worker then stops with its handle
                let _ = SHARED.set(handle.manager);
                SHARED
                    .get()
                    .cloned()
                    .ok_or(QueueError::ManagerShutdown)?
            }
        };

        if let Some(limit) = concurrent_limit {
            manager.set_concurrent_limit(limit).await?;
        }
        Ok(manager)
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::ManagerShutdown)?;

        reply_rx.await.map_err(|_| QueueError::ManagerShutdown)
    }

    /// Admit one file. Rejections that are not errors come back as
    /// [`Admission::Duplicate`] or [`Admission::AlreadyUploaded`].
    pub async fn add(&self, file: FileInput, request: UploadRequest) -> Result<Admission> {
        self.call(|reply| ManagerCommand::Add { file, request, reply }).await?
    }

    /// Admit several files for the same target, one outcome per file.
    ///
    /// Fails with [`QueueError::BatchInFlight`] while an identical batch is
    /// still being admitted.
    pub async fn add_batch(&self, files: Vec<FileInput>, request: UploadRequest) -> Result<Vec<Result<Admission>>> {
        let key = dedup::batch_key(
            files.iter().map(|file| (file.filename.as_str(), file.size())),
            &request.context_id,
            request.set_id.as_deref(),
        );
        let _guard = self.batches.try_acquire(key).ok_or(QueueError::BatchInFlight)?;
        debug!(files = files.len(), "admitting batch");

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            outcomes.push(self.add(file, request.clone()).await);
        }
        Ok(outcomes)
    }

    pub async fn pause(&self, upload_id: UploadId) -> Result<()> {
        self.call(|reply| ManagerCommand::Pause { upload_id, reply }).await?
    }

    pub async fn resume(&self, upload_id: UploadId) -> Result<()> {
        self.call(|reply| ManagerCommand::Resume { upload_id, reply }).await?
    }

    /// Abort and remove an item. Refused once its registration has started.
    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        self.call(|reply| ManagerCommand::Cancel { upload_id, reply }).await?
    }

    /// Re-queue a failed item with a fresh retry budget. Refused with
    /// [`QueueError::DuplicateQueued`] while another item for the same file is
    /// still pending or in flight.
    pub async fn retry(&self, upload_id: UploadId) -> Result<()> {
        self.call(|reply| ManagerCommand::Retry { upload_id, reply }).await?
    }

    pub async fn pause_all_active(&self) -> Result<Vec<UploadId>> {
        self.call(|reply| ManagerCommand::PauseAllActive { reply }).await
    }

    pub async fn resume_all_paused(&self) -> Result<Vec<UploadId>> {
        self.call(|reply| ManagerCommand::ResumeAllPaused { reply }).await
    }

    pub async fn set_priority(&self, upload_id: UploadId, priority: i32) -> Result<()> {
        self.call(|reply| ManagerCommand::SetPriority { upload_id, priority, reply }).await?
    }

    /// Dispatch the given items in this sequence, relative to each other.
    pub async fn reorder(&self, upload_ids: Vec<UploadId>) -> Result<()> {
        self.call(|reply| ManagerCommand::Reorder { upload_ids, reply }).await?
    }

    /// Attach callbacks to an item, typically after a restart and before `retry`.
    pub async fn register_callback(&self, upload_id: UploadId, callbacks: ItemCallbacks) -> Result<()> {
        self.call(|reply| ManagerCommand::RegisterCallback { upload_id, callbacks, reply }).await?
    }

    pub async fn set_online(&self, online: bool) -> Result<()> {
        self.call(|reply| ManagerCommand::SetOnline { online, reply }).await
    }

    pub async fn set_concurrent_limit(&self, limit: usize) -> Result<()> {
        self.call(|reply| ManagerCommand::SetConcurrentLimit { limit, reply }).await?
    }

    pub async fn process_queue(&self) -> Result<()> {
        self.call(|reply| ManagerCommand::ProcessQueue { reply }).await
    }

    pub async fn get_item(&self, upload_id: UploadId) -> Result<Option<UploadItem>> {
        self.call(|reply| ManagerCommand::GetItem { upload_id, reply }).await
    }

    /// Snapshot of the queue in dispatch order.
    pub async fn list_items(&self) -> Result<Vec<UploadItem>> {
        self.call(|reply| ManagerCommand::ListItems { reply }).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.call(|reply| ManagerCommand::Stats { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.call(|reply| ManagerCommand::History { reply }).await?
    }

    pub async fn clear_completed_older_than(&self, hours: u64) -> Result<usize> {
        self.call(|reply| ManagerCommand::ClearCompletedOlderThan { hours, reply }).await?
    }

    pub async fn prune_history(&self, days: u32) -> Result<usize> {
        self.call(|reply| ManagerCommand::PruneHistory { days, reply }).await?
    }

    /// Feed connectivity from a watch channel until either side goes away.
    pub fn watch_connectivity(&self, mut online_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let online = *online_rx.borrow_and_update();
                if manager.set_online(online).await.is_err() {
                    break;
                }
                if online_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Every subscriber gets its own copy of each event. A receiver that falls
    /// behind the channel capacity loses the oldest ones (`RecvError::Lagged`).
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F> {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }

    /// Events of a single item only.
    pub fn subscribe_item(&self, upload_id: UploadId) -> FilteredEventReceiver<impl Fn(&UploadEvent) -> bool + use<>> {
        self.subscribe_filtered(move |event: &UploadEvent| event.upload_id() == Some(upload_id))
    }
}

/// Event receiver that skips events rejected by `filter`.
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> std::result::Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
