//! Background upload queue: admission, dispatch, retries and the per-item pipeline.

pub mod batch;
pub mod dedup;
pub mod progress;
pub mod resolver;
mod manager;
mod manager_worker;
mod worker;

pub use batch::{ActiveBatches, BatchGuard};
pub use manager::{FilteredEventReceiver, UploadManager, UploadManagerBuilder, UploadManagerHandle};
pub use progress::ProgressEstimator;
pub use resolver::{CallbackResolver, CALLBACK_UNRESOLVED};
