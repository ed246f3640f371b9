use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::queue::dedup;
use super::types::{
    ErrorCategory, FileInput, FileRef, ItemError, PauseReason, Progress, UploadId, UploadRequest, UploadStatus,
};

/// One queued file. The payload itself lives in the queue store under `file_ref`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UploadItem {
    pub id: UploadId,
    pub file_ref: FileRef,
    /// Identity digest of (filename, size, context id, set id)
    pub file_hash: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub context_type: String,
    pub context_id: String,
    #[serde(default)]
    pub set_id: Option<String>,
    pub status: UploadStatus,
    #[serde(default)]
    pub paused_by: Option<PauseReason>,
    pub priority: i32,
    pub order: i64,
    pub progress: Progress,
    #[serde(default)]
    pub error: Option<ItemError>,
    /// Failed attempts over all categories since admission or the last manual retry
    #[serde(default)]
    pub retry_count: u32,
    /// Failed attempts per category, each bounded by that category's budget
    #[serde(default)]
    pub category_failures: HashMap<ErrorCategory, u32>,
    #[serde(default)]
    pub media_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadItem {
    pub fn new(file: &FileInput, request: &UploadRequest, order: i64) -> Self {
        let size = file.size();
        let now = Utc::now();

        Self {
            id: UploadId::new(),
            file_ref: FileRef::new(),
            file_hash: dedup::file_hash(
                &file.filename,
                size,
                &request.context_id,
                request.set_id.as_deref(),
            ),
            filename: file.filename.clone(),
            size,
            mime_type: file.mime_type.clone(),
            context_type: request.context_type.clone(),
            context_id: request.context_id.clone(),
            set_id: request.set_id.clone(),
            status: UploadStatus::Pending,
            paused_by: None,
            priority: request.priority,
            order,
            progress: Progress::waiting(size),
            error: None,
            retry_count: 0,
            category_failures: HashMap::new(),
            media_data: request.media_data.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn failures_in(&self, category: ErrorCategory) -> u32 {
        self.category_failures.get(&category).copied().unwrap_or(0)
    }

    /// Stores the new count for `category`. Counts never go down, so neither
    /// does `retry_count`.
    pub fn record_failures(&mut self, category: ErrorCategory, failures: u32) {
        let previous = self.failures_in(category);
        if failures <= previous {
            return;
        }
        self.category_failures.insert(category, failures);
        self.retry_count = self.retry_count.saturating_add(failures - previous);
    }

    /// Forget every failure, as a manual retry does.
    pub fn reset_failures(&mut self) {
        self.category_failures.clear();
        self.retry_count = 0;
    }
}

/// Extra figures kept with a history record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct HistoryMetadata {
    /// Average bytes per second over the whole attempt
    pub upload_speed: f64,
    pub duration_ms: u64,
}

/// Audit record written when an item reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistoryEntry {
    pub upload_id: UploadId,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub context_type: String,
    pub context_id: String,
    pub status: UploadStatus,
    #[serde(default)]
    pub error: Option<ItemError>,
    pub completed_at: DateTime<Utc>,
    pub metadata: HistoryMetadata,
}

impl HistoryEntry {
    pub fn from_item(item: &UploadItem, status: UploadStatus, metadata: HistoryMetadata) -> Self {
        Self {
            upload_id: item.id,
            filename: item.filename.clone(),
            size: item.size,
            mime_type: item.mime_type.clone(),
            context_type: item.context_type.clone(),
            context_id: item.context_id.clone(),
            status,
            error: item.error.clone(),
            completed_at: Utc::now(),
            metadata,
        }
    }
}
