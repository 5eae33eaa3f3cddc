//! Transcode job dispatcher
//!
//! Cuts each session's ingest chunk stream into input segments and submits one
//! job per configured variant (plus a periodic thumbnail) to the executor
//! pool. Job ids are derived from (session, input, target), so submitting the
//! same work twice returns the existing job instead of running it again.
//!
//! Jobs run concurrently up to `max_concurrency` across all sessions; the
//! publisher restores slot order at publish time. At most `max_pending_jobs`
//! jobs wait for a slot: beyond that the segmenter stops reading its feed, the
//! bounded ingest queue fills and the gateway throttles. Transient executor failures
//! are retried with backoff, permanent ones degrade the variant, and a failure
//! to persist output moves the whole session to ERRORED.

use crate::config::{DispatcherConfig, IngestConfig};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    job_id, EncodedOutput, InputSegment, JobResult, JobState, JobTarget, TranscodeJob, Variant,
};
use crate::services::executor::{ExecutorError, TranscodeExecutor, TranscodeRequest};
use crate::services::publisher::{SegmentPublisher, VariantWriter};
use crate::services::session_registry::SessionRegistry;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use resilience::{with_retry, ErrorClass, RetryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unit handed from the ingest gateway to a session's segmenter
#[derive(Debug, Clone)]
pub enum IngestFrame {
    Chunk(Bytes),
    /// Ingest dropped: cut whatever is buffered into a final short segment
    Flush,
}

struct JobEntry {
    job: Mutex<TranscodeJob>,
    state: watch::Sender<JobState>,
}

impl JobEntry {
    fn update(&self, f: impl FnOnce(&mut TranscodeJob)) {
        let state = {
            let mut job = self.job.lock();
            f(&mut job);
            job.state
        };
        self.state.send_replace(state);
    }
}

fn classify(err: &ExecutorError) -> ErrorClass {
    match err {
        ExecutorError::Transient(_) => ErrorClass::Transient,
        ExecutorError::Permanent(_) => ErrorClass::Permanent,
    }
}

pub struct TranscodeDispatcher {
    config: DispatcherConfig,
    ingest: IngestConfig,
    executor: Arc<dyn TranscodeExecutor>,
    publisher: Arc<SegmentPublisher>,
    registry: Arc<SessionRegistry>,
    permits: Arc<Semaphore>,
    /// Queued jobs waiting for one of `permits`
    pending: Arc<Semaphore>,
    jobs: DashMap<Uuid, Arc<JobEntry>>,
    /// Sessions with a cleanup task waiting for their end
    tracked: DashMap<Uuid, ()>,
    writers: DashMap<(Uuid, Variant), Arc<VariantWriter>>,
    feeds: DashMap<Uuid, mpsc::Sender<IngestFrame>>,
}

impl TranscodeDispatcher {
    pub fn new(
        config: DispatcherConfig,
        ingest: IngestConfig,
        executor: Arc<dyn TranscodeExecutor>,
        publisher: Arc<SegmentPublisher>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            pending: Arc::new(Semaphore::new(config.max_pending_jobs)),
            config,
            ingest,
            executor,
            publisher,
            registry,
            jobs: DashMap::new(),
            tracked: DashMap::new(),
            writers: DashMap::new(),
            feeds: DashMap::new(),
        }
    }

    /// Submit one unit of work; duplicates return the existing job id
    ///
    /// A duplicate of a job that failed is queued again; anything else
    /// (queued, running, succeeded) is returned as is.
    pub fn submit(
        self: &Arc<Self>,
        session_id: Uuid,
        input: InputSegment,
        target: JobTarget,
    ) -> Result<Uuid> {
        self.enqueue(session_id, input, target, None)
    }

    fn enqueue(
        self: &Arc<Self>,
        session_id: Uuid,
        input: InputSegment,
        target: JobTarget,
        queue_slot: Option<OwnedSemaphorePermit>,
    ) -> Result<Uuid> {
        if input.session_id != session_id {
            return Err(AppError::BadRequest(format!(
                "input {} does not belong to session {session_id}",
                input.reference()
            )));
        }
        let cancel = self.registry.cancellation(session_id)?;
        if !self.registry.is_accepting(session_id) {
            return Err(AppError::SessionClosed(session_id));
        }

        let id = job_id(session_id, input.index, &target);
        let entry = match self.jobs.entry(id) {
            Entry::Occupied(existing) => {
                let entry = existing.get().clone();
                drop(existing);
                let requeued = {
                    let mut job = entry.job.lock();
                    if job.state == JobState::Failed {
                        job.state = JobState::Queued;
                        job.error = None;
                        job.retryable = false;
                        job.finished_at = None;
                        true
                    } else {
                        false
                    }
                };
                if !requeued {
                    debug!(job_id = %id, "Duplicate submission ignored");
                    return Ok(id);
                }
                entry.state.send_replace(JobState::Queued);
                info!(job_id = %id, %session_id, "Failed job resubmitted");
                entry
            }
            Entry::Vacant(slot) => {
                let job = TranscodeJob::queued(&input, target.clone());
                let (state, _) = watch::channel(JobState::Queued);
                let entry = Arc::new(JobEntry {
                    job: Mutex::new(job),
                    state,
                });
                slot.insert(entry.clone());
                entry
            }
        };
        self.track_session(session_id, &cancel);

        debug!(
            job_id = %id,
            %session_id,
            index = input.index,
            target = target.label(),
            "Job queued"
        );
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher
                .run_job(entry, input, target, cancel, queue_slot)
                .await;
        });
        Ok(id)
    }

    /// Drop the session's job records `job_retention` after it ends
    fn track_session(self: &Arc<Self>, session_id: Uuid, cancel: &CancellationToken) {
        if self.tracked.insert(session_id, ()).is_some() {
            return;
        }
        let dispatcher = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            tokio::time::sleep(dispatcher.config.job_retention).await;
            dispatcher.forget_session(session_id);
        });
    }

    fn forget_session(&self, session_id: Uuid) {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| entry.job.lock().session_id != session_id);
        self.writers.retain(|(session, _), _| *session != session_id);
        self.tracked.remove(&session_id);
        debug!(%session_id, pruned = before.saturating_sub(self.jobs.len()), "Job records pruned");
    }

    /// Snapshot of a job record
    pub fn job(&self, job_id: Uuid) -> Option<TranscodeJob> {
        self.jobs.get(&job_id).map(|e| e.job.lock().clone())
    }

    /// Wait for a job to finish and return its result
    pub async fn await_result(&self, job_id: Uuid) -> Result<JobResult> {
        let entry = self
            .jobs
            .get(&job_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;

        let mut rx = entry.state.subscribe();
        rx.wait_for(|state| state.is_finished())
            .await
            .map_err(|_| AppError::Internal(format!("job {job_id} tracker dropped")))?;

        let job = entry.job.lock().clone();
        match job.result {
            Some(result) if job.state == JobState::Succeeded => Ok(result),
            _ => Err(AppError::JobFailed {
                job_id,
                retryable: job.retryable,
                reason: job.error.unwrap_or_else(|| "unknown failure".to_string()),
            }),
        }
    }

    fn writer(&self, session_id: Uuid, variant: &Variant) -> Result<Arc<VariantWriter>> {
        match self.writers.entry((session_id, variant.clone())) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let writer = Arc::new(self.publisher.open_track(session_id, variant)?);
                slot.insert(writer.clone());
                Ok(writer)
            }
        }
    }

    async fn run_job(
        &self,
        entry: Arc<JobEntry>,
        input: InputSegment,
        target: JobTarget,
        cancel: CancellationToken,
        queue_slot: Option<OwnedSemaphorePermit>,
    ) {
        let (id, session_id) = {
            let job = entry.job.lock();
            (job.id, job.session_id)
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.finish_failed(&entry, "session ended before the job started", &target, false);
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish_failed(&entry, "dispatcher shut down", &target, false);
                    return;
                }
            },
        };
        drop(queue_slot);

        entry.update(|job| job.state = JobState::Running);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = with_retry(&self.config.retry, classify, |attempt| {
                entry.update(|job| job.retry_count = attempt - 1);
                let executor = self.executor.clone();
                let request = TranscodeRequest {
                    job_id: id,
                    input: input.clone(),
                    target: target.clone(),
                };
                async move { executor.transcode(request).await }
            }) => Some(outcome),
        };
        drop(permit);

        match attempt {
            None => {
                debug!(job_id = %id, %session_id, "Job cancelled with its session");
                self.finish_failed(&entry, "session ended", &target, false);
            }
            Some(Ok(retried)) => {
                if retried.attempts > 1 {
                    metrics::transcode_retries(retried.attempts - 1);
                }
                self.deliver(&entry, &input, &target, retried.value).await;
            }
            Some(Err(failure)) => {
                let retryable = matches!(failure, RetryError::Exhausted { .. });
                let attempts = failure.attempts();
                let reason = failure.into_inner().to_string();
                warn!(
                    job_id = %id,
                    %session_id,
                    target = target.label(),
                    attempts,
                    retryable,
                    error = %reason,
                    "Transcode job failed permanently"
                );
                self.finish_failed(&entry, &reason, &target, retryable);

                if let JobTarget::Rendition(variant) = &target {
                    self.registry.mark_degraded(session_id, variant);
                    match self.writer(session_id, variant) {
                        Ok(writer) => {
                            if let Err(e) = writer.skip(input.index) {
                                debug!(job_id = %id, error = %e, "Slot skip after session end");
                            }
                        }
                        Err(e) => debug!(job_id = %id, error = %e, "No writer to skip slot"),
                    }
                }
            }
        }
    }

    async fn deliver(
        &self,
        entry: &JobEntry,
        input: &InputSegment,
        target: &JobTarget,
        output: EncodedOutput,
    ) {
        let session_id = input.session_id;
        let size_bytes = output.data.len();
        let duration_ms = output.duration.as_millis() as u64;

        let stored = match target {
            JobTarget::Rendition(variant) => match self.writer(session_id, variant) {
                Ok(writer) => writer
                    .publish(input.index, output.data, output.duration)
                    .await
                    .map(|published| published.storage_ref.unwrap_or_default()),
                Err(e) => Err(e),
            },
            JobTarget::Thumbnail => {
                let stored = self
                    .publisher
                    .store_thumbnail(session_id, input.index, output.data)
                    .await;
                if let Ok(reference) = &stored {
                    self.registry.record_thumbnail(session_id, reference.clone());
                }
                stored
            }
        };

        match stored {
            Ok(storage_ref) => {
                entry.update(|job| {
                    job.state = JobState::Succeeded;
                    job.result = Some(JobResult {
                        storage_ref,
                        duration_ms,
                        size_bytes,
                    });
                    job.finished_at = Some(Utc::now());
                });
                metrics::transcode_job(target.label(), "succeeded");
            }
            Err(AppError::Storage(detail)) => {
                error!(
                    %session_id,
                    target = target.label(),
                    error = %detail,
                    "Failed to persist job output"
                );
                self.finish_failed(entry, &detail, target, false);
                let reason = format!("storage unavailable: {detail}");
                if let Err(e) = self.registry.fail(session_id, reason) {
                    error!(%session_id, error = %e, "Failed to mark session errored");
                }
            }
            Err(e) => {
                warn!(%session_id, target = target.label(), error = %e, "Job output not published");
                self.finish_failed(entry, &e.to_string(), target, false);
            }
        }
    }

    fn finish_failed(&self, entry: &JobEntry, reason: &str, target: &JobTarget, retryable: bool) {
        entry.update(|job| {
            job.state = JobState::Failed;
            job.error = Some(reason.to_string());
            job.retryable = retryable;
            job.finished_at = Some(Utc::now());
        });
        metrics::transcode_job(target.label(), "failed");
    }

    /// Sender feeding the session's segmenter, started on first use
    ///
    /// A reconnecting ingest gets the same feed, so input indices continue.
    pub fn open_feed(self: &Arc<Self>, session_id: Uuid) -> Result<mpsc::Sender<IngestFrame>> {
        let cancel = self.registry.cancellation(session_id)?;
        if cancel.is_cancelled() {
            return Err(AppError::SessionClosed(session_id));
        }

        match self.feeds.entry(session_id) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.ingest.queue_capacity);
                slot.insert(tx.clone());
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move {
                    dispatcher.run_segmenter(session_id, rx, cancel).await;
                });
                Ok(tx)
            }
        }
    }

    async fn run_segmenter(
        self: Arc<Self>,
        session_id: Uuid,
        mut frames: mpsc::Receiver<IngestFrame>,
        cancel: CancellationToken,
    ) {
        let mut buffer = BytesMut::new();
        let mut index = 0u64;
        let segment_bytes = self.ingest.input_segment_bytes;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = frames.recv() => frame,
            };

            match frame {
                Some(IngestFrame::Chunk(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    while buffer.len() >= segment_bytes {
                        let data = buffer.split_to(segment_bytes).freeze();
                        self.dispatch_input(session_id, index, data, &cancel).await;
                        index += 1;
                    }
                }
                Some(IngestFrame::Flush) => {
                    if !buffer.is_empty() {
                        let data = buffer.split().freeze();
                        self.dispatch_input(session_id, index, data, &cancel).await;
                        index += 1;
                    }
                }
                None => break,
            }
        }

        self.feeds.remove(&session_id);
        self.writers.retain(|(session, _), _| *session != session_id);
        debug!(%session_id, segments = index, "Segmenter stopped");
    }

    fn segment_duration(&self, len: usize) -> Duration {
        let full = self.ingest.input_segment_duration;
        if len >= self.ingest.input_segment_bytes {
            full
        } else {
            full.mul_f64(len as f64 / self.ingest.input_segment_bytes as f64)
        }
    }

    /// Queue one job per target, waiting for queue room before each
    async fn dispatch_input(
        self: &Arc<Self>,
        session_id: Uuid,
        index: u64,
        data: Bytes,
        cancel: &CancellationToken,
    ) {
        let input = InputSegment {
            session_id,
            index,
            duration: self.segment_duration(data.len()),
            data,
        };

        let mut targets: Vec<JobTarget> = self
            .config
            .variants
            .iter()
            .filter(|variant| !self.registry.is_degraded(session_id, variant))
            .cloned()
            .map(JobTarget::Rendition)
            .collect();
        if self.config.thumbnail_every > 0 && index % self.config.thumbnail_every == 0 {
            targets.push(JobTarget::Thumbnail);
        }

        for target in targets {
            let queue_slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                slot = self.pending.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => return,
                },
            };
            if let Err(e) = self.enqueue(session_id, input.clone(), target, Some(queue_slot)) {
                debug!(%session_id, index, error = %e, "Input segment not dispatched");
                return;
            }
        }
    }
}
