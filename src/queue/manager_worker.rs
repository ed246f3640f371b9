use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::config::QueueConfig;
use crate::core::{
    Admission, ErrorCategory, FileInput, HistoryEntry, HistoryMetadata, HistoryStore,
    ItemCallbacks, ItemError, ManagerCommand, PauseReason, Progress, QueueError, QueueStats,
    QueueStore, QuotaUsage, Result, Transfer, UploadEvent, UploadId, UploadItem, UploadRequest,
    UploadStatus,
};
use crate::utils::{RetryDecision, RetryPolicy};
use super::dedup;
use super::resolver::CallbackResolver;
use super::worker::{PipelineOutcome, PipelinePhase, UploadWorker};

/// How long shutdown waits for in-flight items to settle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ActiveUpload {
    cancellation_token: CancellationToken,
    phase: PipelinePhase,
}

/// Collaborators the worker is built from.
pub(crate) struct WorkerParts {
    pub store: Arc<dyn QueueStore>,
    pub history: Arc<dyn HistoryStore>,
    pub transfer: Arc<dyn Transfer>,
    pub resolver: CallbackResolver,
    pub config: QueueConfig,
}

/// Owns every item, callback and in-flight transfer. Only reachable through
/// the commands the manager handle sends.
pub struct UploadManagerWorker {
    store: Arc<dyn QueueStore>,
    history: Arc<dyn HistoryStore>,
    transfer: Arc<dyn Transfer>,
    resolver: CallbackResolver,
    config: QueueConfig,
    policy: RetryPolicy,

    items: HashMap<UploadId, UploadItem>,
    callbacks: HashMap<UploadId, ItemCallbacks>,
    active: HashMap<UploadId, ActiveUpload>,
    /// Pending items waiting out a retry delay
    backoff: HashSet<UploadId>,
    online: bool,
    next_order: i64,

    event_tx: broadcast::Sender<UploadEvent>,
    completion_tx: mpsc::UnboundedSender<(UploadId, PipelineOutcome)>,
    progress_tx: mpsc::UnboundedSender<(UploadId, Progress)>,
    retry_tx: mpsc::UnboundedSender<UploadId>,
}

impl UploadManagerWorker {
    pub(crate) async fn run(
        parts: WorkerParts,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();

        let mut worker = Self {
            store: parts.store,
            history: parts.history,
            transfer: parts.transfer,
            resolver: parts.resolver,
            policy: parts.config.retry_policy(),
            config: parts.config,
            items: HashMap::new(),
            callbacks: HashMap::new(),
            active: HashMap::new(),
            backoff: HashSet::new(),
            online: true,
            next_order: 0,
            event_tx,
            completion_tx,
            progress_tx,
            retry_tx,
        };

        if let Err(err) = worker.restore_state().await {
            error!(error = %err, "failed to restore queue state");
        }
        worker.prune_history().await;

        let period = worker.config.quota_refresh_interval.max(Duration::from_secs(1));
        let mut quota_tick = tokio::time::interval(period);
        quota_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        worker.process_queue().await;

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => worker.handle_command(command).await,
                    None => break,
                },
                Some((upload_id, outcome)) = completion_rx.recv() => {
                    worker.handle_completion(upload_id, outcome).await;
                }
                Some((upload_id, progress)) = progress_rx.recv() => {
                    worker.handle_progress(upload_id, progress).await;
                    continue;
                }
                Some(upload_id) = retry_rx.recv() => {
                    worker.backoff.remove(&upload_id);
                }
                _ = quota_tick.tick() => {
                    worker.refresh_quota().await;
                }
            }

            worker.process_queue().await;
        }

        worker.shutdown(&mut completion_rx).await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Add { file, request, reply } => {
                let result = self.add_to_queue(file, request).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Pause { upload_id, reply } => {
                let result = self.pause(upload_id, PauseReason::User).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Resume { upload_id, reply } => {
                let result = self.resume(upload_id).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Cancel { upload_id, reply } => {
                let result = self.cancel(upload_id).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Retry { upload_id, reply } => {
                let result = self.retry(upload_id).await;
                let _ = reply.send(result);
            }
            ManagerCommand::PauseAllActive { reply } => {
                let paused = self.pause_all_active(PauseReason::User).await;
                let _ = reply.send(paused);
            }
            ManagerCommand::ResumeAllPaused { reply } => {
                let resumed = self.resume_paused(|_| true).await;
                let _ = reply.send(resumed);
            }
            ManagerCommand::SetPriority { upload_id, priority, reply } => {
                let result = self.set_priority(upload_id, priority).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Reorder { upload_ids, reply } => {
                let result = self.reorder(upload_ids).await;
                let _ = reply.send(result);
            }
            ManagerCommand::RegisterCallback { upload_id, callbacks, reply } => {
                let result = if self.items.contains_key(&upload_id) {
                    self.callbacks.insert(upload_id, callbacks);
                    Ok(())
                } else {
                    Err(QueueError::NotFound(upload_id))
                };
                let _ = reply.send(result);
            }
            ManagerCommand::SetOnline { online, reply } => {
                self.set_online(online).await;
                let _ = reply.send(());
            }
            ManagerCommand::SetConcurrentLimit { limit, reply } => {
                let result = if limit == 0 {
                    Err(QueueError::invalid_parameter("concurrent limit must be at least 1"))
                } else {
                    info!(limit, "concurrent limit changed");
                    self.config.concurrent_limit = limit;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            ManagerCommand::ProcessQueue { reply } => {
                self.process_queue().await;
                let _ = reply.send(());
            }
            ManagerCommand::GetItem { upload_id, reply } => {
                let _ = reply.send(self.items.get(&upload_id).cloned());
            }
            ManagerCommand::ListItems { reply } => {
                let mut items: Vec<UploadItem> = self.items.values().cloned().collect();
                items.sort_by(dispatch_order);
                let _ = reply.send(items);
            }
            ManagerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            ManagerCommand::History { reply } => {
                let _ = reply.send(self.history.list().await);
            }
            ManagerCommand::ClearCompletedOlderThan { hours, reply } => {
                let result = self.clear_completed_older_than(hours).await;
                let _ = reply.send(result);
            }
            ManagerCommand::PruneHistory { days, reply } => {
                let _ = reply.send(self.history.prune_older_than(days).await);
            }
            ManagerCommand::Shutdown { reply } => {
                // handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn add_to_queue(&mut self, file: FileInput, request: UploadRequest) -> Result<Admission> {
        if request.context_id.trim().is_empty() {
            return Err(QueueError::MissingContext);
        }
        if request.context_type.trim().is_empty() {
            return Err(QueueError::invalid_parameter("context type is required"));
        }

        let size = file.size();
        let file_hash = dedup::file_hash(&file.filename, size, &request.context_id, request.set_id.as_deref());
        if let Some(existing) = self.store.check_duplicate(&file_hash).await? {
            debug!(filename = %file.filename, existing = %existing.id, "duplicate admission rejected");
            return Ok(Admission::Duplicate {
                existing: Box::new(existing),
            });
        }

        if let Some(existing) = dedup::find_existing(
            &file.filename,
            size,
            &request.existing_media,
            self.config.duplicate_size_tolerance,
        ) {
            debug!(filename = %file.filename, "file already present in the target set");
            return Ok(Admission::AlreadyUploaded {
                existing: existing.clone(),
            });
        }

        if let Some(quota) = self.refresh_quota().await {
            if quota.quota > 0 && quota.percentage > self.config.quota_warning_threshold {
                warn!(percentage = quota.percentage, "storage usage above warning threshold");
                return Err(QueueError::QuotaWarning {
                    percentage: quota.percentage,
                    threshold: self.config.quota_warning_threshold,
                });
            }
        }

        let item = UploadItem::new(&file, &request, self.next_order);
        self.store.save(&item, file.data).await?;
        self.next_order += 1;

        let upload_id = item.id;
        info!(%upload_id, filename = %item.filename, size, context_type = %item.context_type, "upload queued");
        self.items.insert(upload_id, item);
        if let Some(callbacks) = request.callbacks {
            self.callbacks.insert(upload_id, callbacks);
        }
        self.emit(UploadEvent::Added { upload_id });

        Ok(Admission::Queued { upload_id })
    }

    fn is_eligible(&self, item: &UploadItem) -> bool {
        if self.active.contains_key(&item.id) || self.backoff.contains(&item.id) {
            return false;
        }

        match item.status {
            UploadStatus::Pending => true,
            UploadStatus::Paused => {
                self.config.auto_resume && item.paused_by == Some(PauseReason::Connectivity)
            }
            _ => false,
        }
    }

    /// Fills free slots in dispatch order. An item that could not start is
    /// skipped so the next candidate takes its slot.
    async fn process_queue(&mut self) {
        if !self.online {
            return;
        }

        let mut skipped: HashSet<UploadId> = HashSet::new();
        while self.active.len() < self.config.concurrent_limit {
            let next = self
                .items
                .values()
                .filter(|item| !skipped.contains(&item.id) && self.is_eligible(item))
                .min_by(|a, b| dispatch_order(a, b))
                .map(|item| item.id);

            let Some(upload_id) = next else {
                break;
            };
            if !self.start_upload(upload_id).await {
                skipped.insert(upload_id);
            }
        }
    }

    /// Returns true once the pipeline is running and holds a slot.
    async fn start_upload(&mut self, upload_id: UploadId) -> bool {
        if self.items.get(&upload_id).map(|item| item.status) == Some(UploadStatus::Paused) {
            if let Err(err) = self.transition(upload_id, UploadStatus::Pending, |item| item.paused_by = None).await {
                warn!(%upload_id, error = %err, "could not re-admit paused upload");
                return false;
            }
        }

        if let Err(err) = self.transition(upload_id, UploadStatus::Uploading, |_| {}).await {
            warn!(%upload_id, error = %err, "could not start upload");
            return false;
        }

        let Some(item) = self.items.get(&upload_id).cloned() else {
            return false;
        };

        let callbacks = match self.callbacks.get(&upload_id) {
            Some(callbacks) => callbacks.clone(),
            None => match self.resolver.resolve(&item) {
                Ok(callbacks) => {
                    debug!(%upload_id, context_type = %item.context_type, "callbacks rebuilt from context");
                    self.callbacks.insert(upload_id, callbacks.clone());
                    callbacks
                }
                Err(err) => {
                    self.fail(upload_id, err).await;
                    return false;
                }
            },
        };

        let cancellation_token = CancellationToken::new();
        let phase = PipelinePhase::default();
        let worker = UploadWorker {
            store: self.store.clone(),
            transfer: self.transfer.clone(),
            cancellation_token: cancellation_token.clone(),
            phase: phase.clone(),
            progress_window: self.config.progress_window,
        };

        let pipeline = tokio::spawn(worker.run(item, callbacks, self.progress_tx.clone()));
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let outcome = match pipeline.await {
                Ok(outcome) => outcome,
                Err(err) => PipelineOutcome::Failed {
                    error: ItemError::new(ErrorCategory::Unknown, format!("Upload task panicked: {}", err)),
                    retryable: false,
                },
            };

            let _ = completion_tx.send((upload_id, outcome));
        });

        self.active.insert(upload_id, ActiveUpload {
            cancellation_token,
            phase,
        });
        true
    }

    async fn handle_progress(&mut self, upload_id: UploadId, progress: Progress) {
        if !self.active.contains_key(&upload_id) {
            return;
        }
        let Some(item) = self.items.get_mut(&upload_id) else {
            return;
        };
        if item.status != UploadStatus::Uploading {
            return;
        }

        item.progress = progress.clone();
        if let Err(err) = self.store.update_progress(&upload_id, &progress).await {
            debug!(%upload_id, error = %err, "progress not persisted");
        }
        self.emit(UploadEvent::Progress { upload_id, progress });
    }

    async fn handle_completion(&mut self, upload_id: UploadId, outcome: PipelineOutcome) {
        let Some(active) = self.active.remove(&upload_id) else {
            return;
        };

        // pause or cancel already moved the item on
        if active.phase.is_interrupted() {
            debug!(%upload_id, "interrupted upload settled");
            return;
        }

        match outcome {
            PipelineOutcome::Completed { record, speed, duration } => {
                self.complete(upload_id, speed, duration).await;
                debug!(%upload_id, media_id = %record.id, "media registered");
            }
            PipelineOutcome::Cancelled => {
                // aborted without a pause or cancel, e.g. on shutdown
                if let Err(err) = self.transition(upload_id, UploadStatus::Pending, |_| {}).await {
                    warn!(%upload_id, error = %err, "could not requeue aborted upload");
                }
            }
            PipelineOutcome::Failed { error, retryable: true } => {
                let category = error.category;
                let failures = self.items.get(&upload_id).map(|item| item.failures_in(category)).unwrap_or(0);
                match self.policy.decide(category, failures) {
                    RetryDecision::Retry { failures, delay } => {
                        warn!(
                            %upload_id,
                            ?category,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %error.message,
                            "upload failed, retrying"
                        );
                        let requeued = self
                            .transition(upload_id, UploadStatus::Pending, |item| {
                                item.record_failures(category, failures);
                                item.error = Some(error);
                                item.progress = Progress::waiting(item.size);
                            })
                            .await;

                        if requeued.is_ok() {
                            self.schedule_retry(upload_id, delay);
                        }
                    }
                    RetryDecision::GiveUp => {
                        let failures = self.policy.exhausted_count(category, failures);
                        if let Some(item) = self.items.get_mut(&upload_id) {
                            item.record_failures(category, failures);
                        }
                        self.fail(upload_id, error).await;
                    }
                }
            }
            PipelineOutcome::Failed { error, retryable: false } => {
                self.fail(upload_id, error).await;
            }
        }
    }

    fn schedule_retry(&mut self, upload_id: UploadId, delay: Duration) {
        self.backoff.insert(upload_id);
        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_tx.send(upload_id);
        });
    }

    async fn complete(&mut self, upload_id: UploadId, speed: f64, duration: Duration) {
        let Some(item) = self.items.get_mut(&upload_id) else {
            return;
        };
        let progress = Progress::finished(item.size, speed);
        item.progress = progress.clone();
        if let Err(err) = self.store.update_progress(&upload_id, &progress).await {
            debug!(%upload_id, error = %err, "progress not persisted");
        }
        self.emit(UploadEvent::Progress { upload_id, progress });

        if let Err(err) = self.transition(upload_id, UploadStatus::Completed, |item| item.error = None).await {
            warn!(%upload_id, error = %err, "could not complete upload");
            return;
        }

        let Some(item) = self.items.remove(&upload_id) else {
            return;
        };
        let metadata = HistoryMetadata {
            upload_speed: speed,
            duration_ms: duration.as_millis() as u64,
        };
        if let Err(err) = self.history.append(HistoryEntry::from_item(&item, UploadStatus::Completed, metadata)).await {
            warn!(%upload_id, error = %err, "history entry not written");
        }
        if let Err(err) = self.store.remove(&upload_id).await {
            warn!(%upload_id, error = %err, "completed upload not removed from store");
        }
        self.callbacks.remove(&upload_id);

        info!(%upload_id, filename = %item.filename, size = item.size, "upload completed");
        self.emit(UploadEvent::Removed { upload_id });
    }

    /// Terminal failure: error on the item, entry in history, item kept for a manual retry.
    async fn fail(&mut self, upload_id: UploadId, error: ItemError) {
        error!(
            %upload_id,
            category = ?error.category,
            code = error.code.as_deref().unwrap_or_default(),
            error = %error.message,
            "upload failed"
        );

        let failed = self
            .transition(upload_id, UploadStatus::Failed, |item| {
                item.error = Some(error);
            })
            .await;
        if let Err(err) = failed {
            warn!(%upload_id, error = %err, "could not mark upload failed");
            return;
        }

        if let Some(item) = self.items.get(&upload_id) {
            let entry = HistoryEntry::from_item(item, UploadStatus::Failed, HistoryMetadata::default());
            if let Err(err) = self.history.append(entry).await {
                warn!(%upload_id, error = %err, "history entry not written");
            }
        }
    }

    async fn pause(&mut self, upload_id: UploadId, reason: PauseReason) -> Result<()> {
        let status = self.status_of(upload_id)?;

        match status {
            UploadStatus::Pending => {
                self.backoff.remove(&upload_id);
            }
            UploadStatus::Uploading => {
                let active = self
                    .active
                    .get(&upload_id)
                    .ok_or(QueueError::invalid_state("pause", status))?;
                // registration already running
                if !active.phase.interrupt() {
                    return Err(QueueError::invalid_state("pause", status));
                }
                active.cancellation_token.cancel();
            }
            _ => return Err(QueueError::invalid_state("pause", status)),
        }

        self.transition(upload_id, UploadStatus::Paused, |item| {
            item.paused_by = Some(reason);
            item.progress.speed = 0.0;
            item.progress.eta = None;
        })
        .await?;
        info!(%upload_id, reason = ?reason, "upload paused");
        Ok(())
    }

    async fn resume(&mut self, upload_id: UploadId) -> Result<()> {
        let status = self.status_of(upload_id)?;
        if status != UploadStatus::Paused {
            return Err(QueueError::invalid_state("resume", status));
        }

        self.transition(upload_id, UploadStatus::Pending, |item| item.paused_by = None)
            .await
    }

    /// Removes the item and its payload. No history entry, no error.
    async fn cancel(&mut self, upload_id: UploadId) -> Result<()> {
        let status = self.status_of(upload_id)?;

        if let Some(active) = self.active.get(&upload_id) {
            if !active.phase.interrupt() {
                return Err(QueueError::invalid_state("cancel", status));
            }
            active.cancellation_token.cancel();
        }

        self.backoff.remove(&upload_id);
        self.callbacks.remove(&upload_id);
        self.items.remove(&upload_id);
        self.store.remove(&upload_id).await?;

        info!(%upload_id, "upload cancelled");
        self.emit(UploadEvent::Removed { upload_id });
        Ok(())
    }

    async fn retry(&mut self, upload_id: UploadId) -> Result<()> {
        let status = self.status_of(upload_id)?;
        if status != UploadStatus::Failed {
            return Err(QueueError::invalid_state("retry", status));
        }

        let file_hash = self.items.get(&upload_id).map(|item| item.file_hash.clone()).unwrap_or_default();
        if let Some(queued) = self
            .items
            .values()
            .find(|item| item.id != upload_id && item.file_hash == file_hash && !item.status.is_terminal())
        {
            debug!(%upload_id, queued = %queued.id, "retry refused, file already queued");
            return Err(QueueError::DuplicateQueued(queued.id));
        }

        self.transition(upload_id, UploadStatus::Pending, |item| {
            item.reset_failures();
            item.error = None;
            item.progress = Progress::waiting(item.size);
        })
        .await?;
        info!(%upload_id, "upload retried");
        Ok(())
    }

    async fn pause_all_active(&mut self, reason: PauseReason) -> Vec<UploadId> {
        let uploading: Vec<UploadId> = self
            .items
            .values()
            .filter(|item| item.status == UploadStatus::Uploading)
            .map(|item| item.id)
            .collect();

        let mut paused = Vec::new();
        for upload_id in uploading {
            match self.pause(upload_id, reason).await {
                Ok(()) => paused.push(upload_id),
                Err(err) => debug!(%upload_id, error = %err, "upload left running"),
            }
        }
        paused
    }

    async fn resume_paused<F>(&mut self, filter: F) -> Vec<UploadId>
    where
        F: Fn(&UploadItem) -> bool,
    {
        let paused: Vec<UploadId> = self
            .items
            .values()
            .filter(|item| item.status == UploadStatus::Paused && filter(item))
            .map(|item| item.id)
            .collect();

        let mut resumed = Vec::new();
        for upload_id in paused {
            match self.resume(upload_id).await {
                Ok(()) => resumed.push(upload_id),
                Err(err) => debug!(%upload_id, error = %err, "upload left paused"),
            }
        }
        resumed
    }

    async fn set_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }

        self.online = online;
        info!(online, "connectivity changed");
        self.emit(UploadEvent::ConnectivityChanged { online });

        if !online {
            let paused = self.pause_all_active(PauseReason::Connectivity).await;
            debug!(count = paused.len(), "paused for connectivity");
        } else if self.config.auto_resume {
            let resumed = self
                .resume_paused(|item| item.paused_by == Some(PauseReason::Connectivity))
                .await;
            debug!(count = resumed.len(), "resumed after reconnect");
        }
    }

    async fn set_priority(&mut self, upload_id: UploadId, priority: i32) -> Result<()> {
        let item = self.items.get_mut(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        item.priority = priority;
        item.touch();
        self.store.update_priority(&upload_id, priority, None).await
    }

    /// Hands the given items the existing order slots they already occupy,
    /// in the requested sequence.
    async fn reorder(&mut self, upload_ids: Vec<UploadId>) -> Result<()> {
        let mut slots = Vec::with_capacity(upload_ids.len());
        let mut seen = HashSet::new();
        for upload_id in &upload_ids {
            let item = self.items.get(upload_id).ok_or(QueueError::NotFound(*upload_id))?;
            if !seen.insert(*upload_id) {
                return Err(QueueError::invalid_parameter(format!("upload {} listed twice", upload_id)));
            }
            slots.push(item.order);
        }
        slots.sort_unstable();

        for (upload_id, order) in upload_ids.into_iter().zip(slots) {
            let Some(item) = self.items.get_mut(&upload_id) else {
                continue;
            };
            item.order = order;
            item.touch();
            let priority = item.priority;
            self.store.update_priority(&upload_id, priority, Some(order)).await?;
        }
        Ok(())
    }

    async fn clear_completed_older_than(&mut self, hours: u64) -> Result<usize> {
        let cleared = self.store.clear_completed_older_than(hours).await?;
        if cleared > 0 {
            let remaining: HashSet<UploadId> = self.store.list().await?.into_iter().map(|item| item.id).collect();
            let removed: Vec<UploadId> = self
                .items
                .keys()
                .filter(|upload_id| !remaining.contains(*upload_id) && !self.active.contains_key(*upload_id))
                .copied()
                .collect();

            for upload_id in removed {
                self.items.remove(&upload_id);
                self.callbacks.remove(&upload_id);
                self.emit(UploadEvent::Removed { upload_id });
            }
        }
        Ok(cleared)
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            active: self.active.len(),
            concurrent_limit: self.config.concurrent_limit,
            online: self.online,
            ..Default::default()
        };

        for item in self.items.values() {
            match item.status {
                UploadStatus::Pending => stats.pending += 1,
                UploadStatus::Uploading => stats.uploading += 1,
                UploadStatus::Paused => stats.paused += 1,
                UploadStatus::Failed => stats.failed += 1,
                UploadStatus::Completed => {}
            }
        }
        stats
    }

    async fn refresh_quota(&mut self) -> Option<QuotaUsage> {
        match self.store.quota().await {
            Ok(quota) => {
                self.emit(UploadEvent::QuotaUpdated(quota));
                Some(quota)
            }
            Err(err) => {
                warn!(error = %err, "quota query failed");
                None
            }
        }
    }

    fn status_of(&self, upload_id: UploadId) -> Result<UploadStatus> {
        self.items
            .get(&upload_id)
            .map(|item| item.status)
            .ok_or(QueueError::NotFound(upload_id))
    }

    /// Moves an item along an allowed edge, persists it and notifies observers.
    async fn transition<F>(&mut self, upload_id: UploadId, new_status: UploadStatus, update: F) -> Result<()>
    where
        F: FnOnce(&mut UploadItem),
    {
        let item = self.items.get_mut(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        let old_status = item.status;
        if !old_status.can_transition_to(new_status) {
            return Err(QueueError::invalid_state(verb(new_status), old_status));
        }

        item.status = new_status;
        update(item);
        item.touch();

        // the mirror stays authoritative in-process; the next write resyncs the store
        if let Err(err) = self.store.put(item).await {
            warn!(%upload_id, error = %err, "status change not persisted");
        }

        debug!(%upload_id, from = ?old_status, to = ?new_status, "status changed");
        self.emit(UploadEvent::StatusChanged {
            upload_id,
            old_status,
            new_status,
        });
        Ok(())
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn restore_state(&mut self) -> Result<()> {
        let items = self.store.list().await?;

        for mut item in items {
            self.next_order = self.next_order.max(item.order + 1);

            match item.status {
                // the process died mid-flight; the transfer starts over
                UploadStatus::Uploading => {
                    item.status = UploadStatus::Pending;
                    item.progress = Progress::waiting(item.size);
                    self.store.update_status(&item.id, UploadStatus::Pending, item.error.clone()).await?;
                    info!(upload_id = %item.id, "interrupted upload requeued");
                }
                // registered before the crash, only the cleanup was lost
                UploadStatus::Completed => {
                    self.store.remove(&item.id).await?;
                    continue;
                }
                _ => {}
            }

            self.items.insert(item.id, item);
        }

        if !self.items.is_empty() {
            info!(count = self.items.len(), "queue restored");
        }
        Ok(())
    }

    async fn prune_history(&self) {
        let days = self.config.history_retention_days;
        if days == 0 {
            return;
        }

        match self.history.prune_older_than(days).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, days, "history pruned"),
            Err(err) => warn!(error = %err, "history prune failed"),
        }
    }

    /// Aborts in-flight transfers and waits briefly for them to settle, so the
    /// store holds them as `pending` for the next start.
    async fn shutdown(&mut self, completion_rx: &mut mpsc::UnboundedReceiver<(UploadId, PipelineOutcome)>) {
        for active in self.active.values() {
            active.cancellation_token.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.active.is_empty() {
            match tokio::time::timeout_at(deadline, completion_rx.recv()).await {
                Ok(Some((upload_id, outcome))) => self.handle_completion(upload_id, outcome).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(count = self.active.len(), "uploads still running at shutdown");
                    break;
                }
            }
        }

        if let Err(err) = self.store.flush().await {
            warn!(error = %err, "queue store flush failed");
        }
        info!("upload manager stopped");
    }
}

/// `priority desc, order asc`
fn dispatch_order(a: &UploadItem, b: &UploadItem) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.order.cmp(&b.order))
}

fn verb(status: UploadStatus) -> &'static str {
    match status {
        UploadStatus::Pending => "queue",
        UploadStatus::Uploading => "start",
        UploadStatus::Paused => "pause",
        UploadStatus::Completed => "complete",
        UploadStatus::Failed => "fail",
    }
}
