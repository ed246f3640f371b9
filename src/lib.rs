pub mod config;
pub mod core;
pub mod queue;
pub mod store;
pub mod uploaders;
pub mod utils;

// Core types at the crate root
pub use config::{AppConfig, QueueConfig};
pub use crate::core::{
    Admission,
    ErrorCategory,
    ExistingMedia,
    FileInput,
    HistoryEntry,
    ItemCallbacks,
    ItemError,
    MediaRecord,
    MediaRegistrar,
    Progress,
    QueueError,
    QueueStats,
    Result,
    Transfer,
    TransferError,
    TransferResponse,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadRequest,
    UploadStatus,
};
pub use queue::{CallbackResolver, UploadManager, UploadManagerBuilder, UploadManagerHandle};
pub use store::{FileHistoryStore, FileQueueStore, MemoryHistoryStore, MemoryQueueStore};
pub use uploaders::{HttpRegistrar, HttpTransfer};
