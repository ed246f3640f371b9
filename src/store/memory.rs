use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use crate::core::{
    FileRef, HistoryEntry, HistoryStore, ItemError, Progress, QueueError, QueueStore, QuotaUsage,
    Result, UploadId, UploadItem, UploadStatus,
};
use super::{cutoff_days, cutoff_hours};

/// Queue store kept entirely in memory.
///
/// `capacity` of zero means unlimited. `external_usage` stands for storage
/// already consumed outside the queue, e.g. media on the server.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    items: RwLock<HashMap<UploadId, UploadItem>>,
    blobs: RwLock<HashMap<FileRef, Bytes>>,
    capacity: u64,
    external_usage: AtomicU64,
}

impl MemoryQueueStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn set_external_usage(&self, bytes: u64) {
        self.external_usage.store(bytes, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn has_payload(&self, file_ref: &FileRef) -> bool {
        self.blobs.read().await.contains_key(file_ref)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn save(&self, item: &UploadItem, payload: Bytes) -> Result<()> {
        self.blobs.write().await.insert(item.file_ref.clone(), payload);
        self.items.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn put(&self, item: &UploadItem) -> Result<()> {
        let mut items = self.items.write().await;
        let slot = items.get_mut(&item.id).ok_or(QueueError::NotFound(item.id))?;
        *slot = item.clone();
        Ok(())
    }

    async fn get(&self, upload_id: &UploadId) -> Result<Option<UploadItem>> {
        Ok(self.items.read().await.get(upload_id).cloned())
    }

    async fn list(&self) -> Result<Vec<UploadItem>> {
        let mut items: Vec<UploadItem> = self.items.read().await.values().cloned().collect();
        items.sort_by_key(|item| item.order);
        Ok(items)
    }

    async fn load_payload(&self, file_ref: &FileRef) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(file_ref)
            .cloned()
            .ok_or_else(|| QueueError::PayloadMissing(file_ref.to_string()))
    }

    async fn update_progress(&self, upload_id: &UploadId, progress: &Progress) -> Result<()> {
        if let Some(item) = self.items.write().await.get_mut(upload_id) {
            item.progress = progress.clone();
        }
        Ok(())
    }

    async fn update_status(
        &self,
        upload_id: &UploadId,
        status: UploadStatus,
        error: Option<ItemError>,
    ) -> Result<()> {
        let mut items = self.items.write().await;
        let item = items.get_mut(upload_id).ok_or(QueueError::NotFound(*upload_id))?;
        item.status = status;
        item.error = error;
        item.touch();
        Ok(())
    }

    async fn update_priority(&self, upload_id: &UploadId, priority: i32, order: Option<i64>) -> Result<()> {
        let mut items = self.items.write().await;
        let item = items.get_mut(upload_id).ok_or(QueueError::NotFound(*upload_id))?;
        item.priority = priority;
        if let Some(order) = order {
            item.order = order;
        }
        item.touch();
        Ok(())
    }

    async fn remove(&self, upload_id: &UploadId) -> Result<Option<UploadItem>> {
        let removed = self.items.write().await.remove(upload_id);
        if let Some(item) = &removed {
            self.blobs.write().await.remove(&item.file_ref);
        }
        Ok(removed)
    }

    async fn check_duplicate(&self, file_hash: &str) -> Result<Option<UploadItem>> {
        Ok(self
            .items
            .read()
            .await
            .values()
            .find(|item| item.file_hash == file_hash && !item.status.is_terminal())
            .cloned())
    }

    async fn clear_completed_older_than(&self, hours: u64) -> Result<usize> {
        let cutoff = cutoff_hours(hours);
        let mut items = self.items.write().await;
        let expired: Vec<UploadItem> = items
            .values()
            .filter(|item| item.status.is_terminal() && item.updated_at < cutoff)
            .cloned()
            .collect();

        let mut blobs = self.blobs.write().await;
        for item in &expired {
            items.remove(&item.id);
            blobs.remove(&item.file_ref);
        }

        Ok(expired.len())
    }

    async fn quota(&self) -> Result<QuotaUsage> {
        let queued: u64 = self.blobs.read().await.values().map(|blob| blob.len() as u64).sum();
        let usage = queued.saturating_add(self.external_usage.load(Ordering::Relaxed));
        Ok(QuotaUsage::new(self.capacity, usage))
    }
}

/// History kept in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.entries.read().await.clone())
    }

    async fn prune_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = cutoff_days(days);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.completed_at >= cutoff);
        Ok(before - entries.len())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}
