use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use super::errors::{Result, TransferError};
use super::task::{HistoryEntry, UploadItem};
use super::types::{
    FileInput, FileRef, ItemError, Progress, QuotaUsage, UploadId, UploadStatus,
};

/// Progress callback handed to a transfer: `(loaded, total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Server reply to a finished transfer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TransferResponse {
    pub data: serde_json::Value,
}

impl TransferResponse {
    /// Server-assigned file identifier, under `id` or `fileId`.
    pub fn file_id(&self) -> Option<&str> {
        self.data
            .get("id")
            .or_else(|| self.data.get("fileId"))
            .and_then(|value| value.as_str())
    }
}

/// Media record created by a registration call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MediaRecord {
    pub id: String,
    pub data: serde_json::Value,
}

impl MediaRecord {
    pub fn from_value(data: serde_json::Value) -> Self {
        let id = match data.get("id") {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => String::new(),
        };

        Self { id, data }
    }
}

/// Domain context passed along with a registration call.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationContext {
    pub context_id: String,
    pub set_id: Option<String>,
    pub media_data: Option<serde_json::Value>,
}

impl RegistrationContext {
    pub fn for_item(item: &UploadItem) -> Self {
        Self {
            context_id: item.context_id.clone(),
            set_id: item.set_id.clone(),
            media_data: item.media_data.clone(),
        }
    }
}

/// Per-item outcome handed to the completion hook.
#[derive(Debug, Clone, Default)]
pub struct UploadResults {
    pub successful: Vec<MediaRecord>,
    pub failed: Vec<ItemError>,
}

/// Network transfer of a single file.
///
/// Implementations must stop promptly once `cancel` fires and report
/// progress through `on_progress` as bytes leave the process.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn upload(
        &self,
        file: &FileInput,
        cancel: CancellationToken,
        on_progress: ProgressFn,
    ) -> Result<TransferResponse, TransferError>;
}

/// Turns a finished transfer into a domain media record.
///
/// Called at most once per successful transfer; the queue never retries it on its own.
#[async_trait]
pub trait MediaRegistrar: Send + Sync {
    async fn register(
        &self,
        response: &TransferResponse,
        file: &FileInput,
        context: &RegistrationContext,
    ) -> Result<MediaRecord, TransferError>;
}

#[async_trait]
pub trait ReloadHook: Send + Sync {
    async fn reload(&self) -> Result<(), TransferError>;
}

#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, results: &UploadResults) -> Result<(), TransferError>;
}

/// Non-serializable functions attached to one item.
#[derive(Clone)]
pub struct ItemCallbacks {
    pub registrar: Arc<dyn MediaRegistrar>,
    pub reload: Option<Arc<dyn ReloadHook>>,
    pub on_complete: Option<Arc<dyn CompletionHook>>,
}

impl ItemCallbacks {
    pub fn new(registrar: Arc<dyn MediaRegistrar>) -> Self {
        Self {
            registrar,
            reload: None,
            on_complete: None,
        }
    }

    pub fn with_reload(mut self, reload: Arc<dyn ReloadHook>) -> Self {
        self.reload = Some(reload);
        self
    }

    pub fn with_on_complete(mut self, on_complete: Arc<dyn CompletionHook>) -> Self {
        self.on_complete = Some(on_complete);
        self
    }
}

/// Rebuilds callbacks for one context type from persisted item fields.
pub trait RegistrarFactory: Send + Sync {
    fn build(&self, context_id: &str, set_id: Option<&str>) -> ItemCallbacks;
}

impl<F> RegistrarFactory for F
where
    F: Fn(&str, Option<&str>) -> ItemCallbacks + Send + Sync,
{
    fn build(&self, context_id: &str, set_id: Option<&str>) -> ItemCallbacks {
        self(context_id, set_id)
    }
}

/// Durable queue of items and their payloads.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new item together with its payload
    async fn save(&self, item: &UploadItem, payload: Bytes) -> Result<()>;

    /// Overwrite the stored copy of an existing item
    async fn put(&self, item: &UploadItem) -> Result<()>;

    async fn get(&self, upload_id: &UploadId) -> Result<Option<UploadItem>>;

    async fn list(&self) -> Result<Vec<UploadItem>>;

    async fn load_payload(&self, file_ref: &FileRef) -> Result<Bytes>;

    /// Called on every progress report; implementations may coalesce writes
    async fn update_progress(&self, upload_id: &UploadId, progress: &Progress) -> Result<()>;

    async fn update_status(
        &self,
        upload_id: &UploadId,
        status: UploadStatus,
        error: Option<ItemError>,
    ) -> Result<()>;

    async fn update_priority(&self, upload_id: &UploadId, priority: i32, order: Option<i64>) -> Result<()>;

    /// Remove an item and its payload
    async fn remove(&self, upload_id: &UploadId) -> Result<Option<UploadItem>>;

    /// Non-terminal item carrying the given identity hash
    async fn check_duplicate(&self, file_hash: &str) -> Result<Option<UploadItem>>;

    /// Drop terminal items last touched more than `hours` ago
    async fn clear_completed_older_than(&self, hours: u64) -> Result<usize>;

    async fn quota(&self) -> Result<QuotaUsage>;

    /// Write out anything still held back by coalescing
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Append-only audit log of terminal uploads.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<()>;

    async fn list(&self) -> Result<Vec<HistoryEntry>>;

    async fn prune_older_than(&self, days: u32) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}
