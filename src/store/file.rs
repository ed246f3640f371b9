use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::core::{
    FileRef, HistoryEntry, HistoryStore, ItemError, Progress, QueueError, QueueStore, QuotaUsage,
    Result, UploadId, UploadItem, UploadStatus,
};
use super::{cutoff_days, cutoff_hours, write_atomic};

const QUEUE_FILE: &str = "queue.json";
const BLOB_DIR: &str = "blobs";
const DEFAULT_PROGRESS_FLUSH: Duration = Duration::from_secs(2);

struct QueueState {
    items: HashMap<UploadId, UploadItem>,
    /// Progress changed since the last write
    dirty: bool,
    last_write: Instant,
}

/// Queue store backed by a directory:
///
/// ```text
/// <dir>/queue.json        every item, ordered by `order`
/// <dir>/blobs/<file_ref>  raw payloads
/// ```
///
/// Progress reports are held in memory and written at most once per flush
/// interval; any status or priority change writes them out as well.
pub struct FileQueueStore {
    dir: PathBuf,
    capacity: u64,
    progress_flush_interval: Duration,
    state: Mutex<QueueState>,
}

impl FileQueueStore {
    /// Opens or creates the store. `capacity` of zero means unlimited.
    pub async fn open(dir: impl Into<PathBuf>, capacity: u64) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join(BLOB_DIR)).await?;

        let queue_file = dir.join(QUEUE_FILE);
        let items = if tokio::fs::try_exists(&queue_file).await? {
            let data = tokio::fs::read(&queue_file).await?;
            let items: Vec<UploadItem> = serde_json::from_slice(&data)?;
            items.into_iter().map(|item| (item.id, item)).collect()
        } else {
            HashMap::new()
        };
        debug!(dir = %dir.display(), items = items.len(), "queue store opened");

        Ok(Self {
            dir,
            capacity,
            progress_flush_interval: DEFAULT_PROGRESS_FLUSH,
            state: Mutex::new(QueueState {
                items,
                dirty: false,
                last_write: Instant::now(),
            }),
        })
    }

    pub fn with_progress_flush_interval(mut self, interval: Duration) -> Self {
        self.progress_flush_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, file_ref: &FileRef) -> PathBuf {
        self.dir.join(BLOB_DIR).join(file_ref.as_str())
    }

    async fn persist(&self, state: &mut QueueState) -> Result<()> {
        let mut items: Vec<&UploadItem> = state.items.values().collect();
        items.sort_by_key(|item| item.order);

        let data = serde_json::to_vec_pretty(&items)?;
        write_atomic(&self.dir.join(QUEUE_FILE), &data).await?;

        state.dirty = false;
        state.last_write = Instant::now();
        Ok(())
    }

    async fn remove_blob(&self, file_ref: &FileRef) {
        match tokio::fs::remove_file(self.blob_path(file_ref)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(%file_ref, error = %err, "failed to delete payload"),
        }
    }

    async fn blob_usage(&self) -> Result<u64> {
        let mut usage = 0;
        let mut entries = tokio::fs::read_dir(self.dir.join(BLOB_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                usage += metadata.len();
            }
        }
        Ok(usage)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn save(&self, item: &UploadItem, payload: Bytes) -> Result<()> {
        // payload first, so a listed item always has its blob
        write_atomic(&self.blob_path(&item.file_ref), &payload).await?;

        let mut state = self.state.lock().await;
        state.items.insert(item.id, item.clone());
        self.persist(&mut state).await
    }

    async fn put(&self, item: &UploadItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.items.get_mut(&item.id).ok_or(QueueError::NotFound(item.id))?;
        *slot = item.clone();
        self.persist(&mut state).await
    }

    async fn get(&self, upload_id: &UploadId) -> Result<Option<UploadItem>> {
        Ok(self.state.lock().await.items.get(upload_id).cloned())
    }

    async fn list(&self) -> Result<Vec<UploadItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<UploadItem> = state.items.values().cloned().collect();
        items.sort_by_key(|item| item.order);
        Ok(items)
    }

    async fn load_payload(&self, file_ref: &FileRef) -> Result<Bytes> {
        match tokio::fs::read(self.blob_path(file_ref)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::PayloadMissing(file_ref.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_progress(&self, upload_id: &UploadId, progress: &Progress) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get_mut(upload_id) else {
            return Ok(());
        };
        item.progress = progress.clone();
        state.dirty = true;

        if state.last_write.elapsed() >= self.progress_flush_interval {
            self.persist(&mut state).await?;
        }
        Ok(())
    }

    async fn update_status(
        &self,
        upload_id: &UploadId,
        status: UploadStatus,
        error: Option<ItemError>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state.items.get_mut(upload_id).ok_or(QueueError::NotFound(*upload_id))?;
        item.status = status;
        item.error = error;
        item.touch();
        self.persist(&mut state).await
    }

    async fn update_priority(&self, upload_id: &UploadId, priority: i32, order: Option<i64>) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state.items.get_mut(upload_id).ok_or(QueueError::NotFound(*upload_id))?;
        item.priority = priority;
        if let Some(order) = order {
            item.order = order;
        }
        item.touch();
        self.persist(&mut state).await
    }

    async fn remove(&self, upload_id: &UploadId) -> Result<Option<UploadItem>> {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.items.remove(upload_id);
            if removed.is_some() {
                self.persist(&mut state).await?;
            }
            removed
        };

        if let Some(item) = &removed {
            self.remove_blob(&item.file_ref).await;
        }
        Ok(removed)
    }

    async fn check_duplicate(&self, file_hash: &str) -> Result<Option<UploadItem>> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .values()
            .find(|item| item.file_hash == file_hash && !item.status.is_terminal())
            .cloned())
    }

    async fn clear_completed_older_than(&self, hours: u64) -> Result<usize> {
        let cutoff = cutoff_hours(hours);
        let expired: Vec<UploadItem> = {
            let mut state = self.state.lock().await;
            let ids: Vec<UploadId> = state
                .items
                .values()
                .filter(|item| item.status.is_terminal() && item.updated_at < cutoff)
                .map(|item| item.id)
                .collect();
            let expired: Vec<UploadItem> = ids.iter().filter_map(|id| state.items.remove(id)).collect();
            if !expired.is_empty() {
                self.persist(&mut state).await?;
            }
            expired
        };

        for item in &expired {
            self.remove_blob(&item.file_ref).await;
        }
        Ok(expired.len())
    }

    async fn quota(&self) -> Result<QuotaUsage> {
        Ok(QuotaUsage::new(self.capacity, self.blob_usage().await?))
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.dirty {
            self.persist(&mut state).await?;
        }
        Ok(())
    }
}

/// History persisted as one JSON array, oldest first.
pub struct FileHistoryStore {
    path: PathBuf,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl FileHistoryStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read(&path).await?;
            serde_json::from_slice(&data)?
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &[HistoryEntry]) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &data).await
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.push(entry);
        self.persist(&entries).await
    }

    async fn list(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn prune_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = cutoff_days(days);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| entry.completed_at >= cutoff);

        let pruned = before - entries.len();
        if pruned > 0 {
            self.persist(&entries).await?;
        }
        Ok(pruned)
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{FileInput, HistoryMetadata, UploadRequest};
    use super::*;

    fn item(name: &str, size: usize) -> (UploadItem, Bytes) {
        let file = FileInput::new(name, "image/jpeg", vec![3u8; size]);
        let item = UploadItem::new(&file, &UploadRequest::new("selection", "sel-1"), 0);
        (item, file.data)
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (item, payload) = item("a.jpg", 64);

        {
            let store = FileQueueStore::open(dir.path(), 0).await.unwrap();
            store.save(&item, payload).await.unwrap();
            store.update_status(&item.id, UploadStatus::Uploading, None).await.unwrap();
        }

        let store = FileQueueStore::open(dir.path(), 0).await.unwrap();
        let items = store.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, item.id);
        assert_eq!(items[0].status, UploadStatus::Uploading);
        assert_eq!(store.load_payload(&item.file_ref).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_progress_is_coalesced_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (item, payload) = item("a.jpg", 100);
        let store = FileQueueStore::open(dir.path(), 0)
            .await
            .unwrap()
            .with_progress_flush_interval(Duration::from_secs(3600));
        store.save(&item, payload).await.unwrap();

        let progress = Progress {
            loaded: 40,
            total: 100,
            percentage: 40.0,
            ..Default::default()
        };
        store.update_progress(&item.id, &progress).await.unwrap();

        // in memory right away, on disk only after a flush
        assert_eq!(store.get(&item.id).await.unwrap().unwrap().progress.loaded, 40);
        let reopened = FileQueueStore::open(dir.path(), 0).await.unwrap();
        assert_eq!(reopened.get(&item.id).await.unwrap().unwrap().progress.loaded, 0);

        store.flush().await.unwrap();
        let reopened = FileQueueStore::open(dir.path(), 0).await.unwrap();
        assert_eq!(reopened.get(&item.id).await.unwrap().unwrap().progress, progress);
    }

    #[tokio::test]
    async fn test_remove_deletes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (item, payload) = item("a.jpg", 8);
        let store = FileQueueStore::open(dir.path(), 1000).await.unwrap();
        store.save(&item, payload).await.unwrap();
        assert_eq!(store.quota().await.unwrap().usage, 8);

        store.remove(&item.id).await.unwrap();
        assert!(store.get(&item.id).await.unwrap().is_none());
        assert!(matches!(
            store.load_payload(&item.file_ref).await,
            Err(QueueError::PayloadMissing(_))
        ));
        assert_eq!(store.quota().await.unwrap().usage, 0);
    }

    #[tokio::test]
    async fn test_history_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let (item, _) = item("a.jpg", 8);

        {
            let history = FileHistoryStore::open(&path).await.unwrap();
            history
                .append(HistoryEntry::from_item(
                    &item,
                    UploadStatus::Completed,
                    HistoryMetadata { upload_speed: 8.0, duration_ms: 1000 },
                ))
                .await
                .unwrap();
        }

        let history = FileHistoryStore::open(&path).await.unwrap();
        let entries = history.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].upload_id, item.id);
        assert_eq!(entries[0].metadata.duration_ms, 1000);
        assert_eq!(history.prune_older_than(30).await.unwrap(), 0);
    }
}
