use std::path::Path;
use std::time::Duration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::errors::Result;
use super::task::{HistoryEntry, UploadItem};
use super::traits::ItemCallbacks;

// Option<Duration> is persisted as fractional seconds
pub(crate) mod duration_secs_opt {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64))
    }
}

/// Upload item identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a binary payload held by the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FileRef(pub String);

impl FileRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Waiting for a dispatch slot
    Pending,
    /// Transfer or registration in flight
    Uploading,
    /// Held back until resumed
    Paused,
    /// Registered on the server, removed from the queue right after
    Completed,
    /// Terminal until an explicit retry
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }

    /// Allowed edges of the item state machine.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Paused)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Paused)
                | (Uploading, Pending)
                | (Paused, Pending)
                | (Failed, Pending)
        )
    }
}

/// Who put an item on hold. Only connectivity pauses are resumed automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    User,
    Connectivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Server,
    Quota,
    Validation,
    Unknown,
}

/// Failure recorded on an item and in history.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ItemError {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ItemError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }
}

/// Transfer progress of one item.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
    /// Bytes per second over the sample window
    pub speed: f64,
    #[serde(default, with = "duration_secs_opt")]
    pub eta: Option<Duration>,
}

impl Progress {
    pub fn waiting(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn finished(total: u64, speed: f64) -> Self {
        Self {
            loaded: total,
            total,
            percentage: 100.0,
            speed,
            eta: Some(Duration::ZERO),
        }
    }
}

/// Storage usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct QuotaUsage {
    pub quota: u64,
    pub usage: u64,
    pub percentage: f64,
}

impl QuotaUsage {
    /// A zero quota means unlimited storage.
    pub fn new(quota: u64, usage: u64) -> Self {
        let percentage = if quota > 0 {
            (usage as f64 / quota as f64) * 100.0
        } else {
            0.0
        };

        Self { quota, usage, percentage }
    }
}

/// Media already attached to the target set, as known by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExistingMedia {
    pub filename: String,
    pub size: u64,
}

impl ExistingMedia {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
        }
    }
}

/// A file handed to the queue.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileInput {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| super::errors::QueueError::invalid_parameter(format!("Not a file: {}", path.display())))?;
        let data = tokio::fs::read(path).await?;
        let mime_type = guess_mime_type(&filename).to_string();

        Ok(Self::new(filename, mime_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Best-effort MIME type from the extension, covering the formats the product handles.
pub fn guess_mime_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "tif" | "tiff" => "image/tiff",
        "cr2" | "cr3" | "nef" | "arw" | "dng" | "raf" | "orf" => "image/x-raw",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Admission parameters for one file.
#[derive(Clone, Default)]
pub struct UploadRequest {
    pub context_type: String,
    pub context_id: String,
    pub set_id: Option<String>,
    pub priority: i32,
    /// Opaque payload forwarded to the registration call
    pub media_data: Option<serde_json::Value>,
    pub existing_media: Vec<ExistingMedia>,
    pub callbacks: Option<ItemCallbacks>,
}

impl UploadRequest {
    pub fn new(context_type: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            context_type: context_type.into(),
            context_id: context_id.into(),
            ..Default::default()
        }
    }

    pub fn with_set(mut self, set_id: impl Into<String>) -> Self {
        self.set_id = Some(set_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_media_data(mut self, media_data: serde_json::Value) -> Self {
        self.media_data = Some(media_data);
        self
    }

    pub fn with_existing_media(mut self, existing_media: Vec<ExistingMedia>) -> Self {
        self.existing_media = existing_media;
        self
    }

    pub fn with_callbacks(mut self, callbacks: ItemCallbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("context_type", &self.context_type)
            .field("context_id", &self.context_id)
            .field("set_id", &self.set_id)
            .field("priority", &self.priority)
            .field("existing_media", &self.existing_media.len())
            .field("callbacks", &self.callbacks.is_some())
            .finish()
    }
}

/// Result of an admission attempt that did not error.
#[derive(Debug, Clone)]
pub enum Admission {
    Queued {
        upload_id: UploadId,
    },
    /// An item with the same identity hash is still in the queue
    Duplicate {
        existing: Box<UploadItem>,
    },
    /// The caller's media snapshot already holds this file
    AlreadyUploaded {
        existing: ExistingMedia,
    },
}

impl Admission {
    pub fn upload_id(&self) -> Option<UploadId> {
        match self {
            Admission::Queued { upload_id } => Some(*upload_id),
            _ => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Admission::Queued { .. })
    }
}

/// Counts per status plus scheduler parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub uploading: usize,
    pub paused: usize,
    pub failed: usize,
    pub active: usize,
    pub concurrent_limit: usize,
    pub online: bool,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.uploading == 0 && self.active == 0
    }
}

/// Structured notifications. Observers format them for people.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Added {
        upload_id: UploadId,
    },

    StatusChanged {
        upload_id: UploadId,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },

    Progress {
        upload_id: UploadId,
        progress: Progress,
    },

    /// Item left the queue (completed or cancelled)
    Removed {
        upload_id: UploadId,
    },

    QuotaUpdated(QuotaUsage),

    ConnectivityChanged {
        online: bool,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> Option<UploadId> {
        match self {
            UploadEvent::Added { upload_id }
            | UploadEvent::StatusChanged { upload_id, .. }
            | UploadEvent::Progress { upload_id, .. }
            | UploadEvent::Removed { upload_id } => Some(*upload_id),
            _ => None,
        }
    }
}

/// Commands sent from the manager handle to its worker
pub enum ManagerCommand {
    Add {
        file: FileInput,
        request: UploadRequest,
        reply: oneshot::Sender<Result<Admission>>,
    },

    Pause {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    Resume {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    Cancel {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    Retry {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    PauseAllActive {
        reply: oneshot::Sender<Vec<UploadId>>,
    },

    ResumeAllPaused {
        reply: oneshot::Sender<Vec<UploadId>>,
    },

    SetPriority {
        upload_id: UploadId,
        priority: i32,
        reply: oneshot::Sender<Result<()>>,
    },

    Reorder {
        upload_ids: Vec<UploadId>,
        reply: oneshot::Sender<Result<()>>,
    },

    RegisterCallback {
        upload_id: UploadId,
        callbacks: ItemCallbacks,
        reply: oneshot::Sender<Result<()>>,
    },

    SetOnline {
        online: bool,
        reply: oneshot::Sender<()>,
    },

    SetConcurrentLimit {
        limit: usize,
        reply: oneshot::Sender<Result<()>>,
    },

    ProcessQueue {
        reply: oneshot::Sender<()>,
    },

    GetItem {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadItem>>,
    },

    ListItems {
        reply: oneshot::Sender<Vec<UploadItem>>,
    },

    Stats {
        reply: oneshot::Sender<QueueStats>,
    },

    History {
        reply: oneshot::Sender<Result<Vec<HistoryEntry>>>,
    },

    ClearCompletedOlderThan {
        hours: u64,
        reply: oneshot::Sender<Result<usize>>,
    },

    PruneHistory {
        days: u32,
        reply: oneshot::Sender<Result<usize>>,
    },

    /// Stop the worker; replied to once in-flight items have settled
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// crossing the worker channels requires Send
const _: fn() = || {
    fn assert_send<T: Send>() {}
    assert_send::<UploadItem>();
    assert_send::<UploadEvent>();
    assert_send::<ManagerCommand>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use UploadStatus::*;

        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Paused));
        assert!(Uploading.can_transition_to(Pending));
        assert!(Paused.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Uploading));
        assert!(!Paused.can_transition_to(Uploading));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_upload_id_generation() {
        let id1 = UploadId::new();
        let id2 = UploadId::new();

        assert_ne!(id1, id2);
        assert!(!id1.to_string().is_empty());
    }

    #[test]
    fn test_quota_percentage() {
        assert_eq!(QuotaUsage::new(200, 50).percentage, 25.0);
        assert_eq!(QuotaUsage::new(0, 50).percentage, 0.0);
    }

    #[test]
    fn test_progress_eta_roundtrip() {
        let progress = Progress {
            loaded: 10,
            total: 20,
            percentage: 50.0,
            speed: 5.0,
            eta: Some(Duration::from_secs(2)),
        };

        let json = serde_json::to_string(&progress).unwrap();
        let back: Progress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.eta, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("IMG_0001.JPG"), "image/jpeg");
        assert_eq!(guess_mime_type("shoot.nef"), "image/x-raw");
        assert_eq!(guess_mime_type("noext"), "application/octet-stream");
    }
}
