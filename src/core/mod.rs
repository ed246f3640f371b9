mod errors;
mod task;
mod traits;
mod types;

pub use errors::{QueueError, Result, TransferError};
pub use task::{HistoryEntry, HistoryMetadata, UploadItem};
pub use traits::{
    CompletionHook,
    HistoryStore,
    ItemCallbacks,
    MediaRecord,
    MediaRegistrar,
    ProgressFn,
    QueueStore,
    RegistrarFactory,
    RegistrationContext,
    ReloadHook,
    Transfer,
    TransferResponse,
    UploadResults,
};
pub use types::{
    guess_mime_type,
    Admission,
    ErrorCategory,
    ExistingMedia,
    FileInput,
    FileRef,
    ItemError,
    ManagerCommand,
    PauseReason,
    Progress,
    QueueStats,
    QuotaUsage,
    UploadEvent,
    UploadId,
    UploadRequest,
    UploadStatus,
};
