mod file;
mod memory;

use std::path::Path;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crate::core::Result;

pub use file::{FileHistoryStore, FileQueueStore};
pub use memory::{MemoryHistoryStore, MemoryQueueStore};

/// Write through a sibling temp file and rename, so readers never see a torn file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub(crate) fn cutoff_hours(hours: u64) -> DateTime<Utc> {
    cutoff(i64::try_from(hours).ok().and_then(ChronoDuration::try_hours))
}

pub(crate) fn cutoff_days(days: u32) -> DateTime<Utc> {
    cutoff(ChronoDuration::try_days(i64::from(days)))
}

// an unrepresentable window reaches back to the beginning of time
fn cutoff(window: Option<ChronoDuration>) -> DateTime<Utc> {
    window
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
