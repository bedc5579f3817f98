// src/manager.rs

use crate::auth::TokenProvider;
use crate::config::ManagerConfig;
use crate::downloader::{DownloadWorker, ProgressSink, TransferOutcome, TransferRequest};
use crate::limiter::SpeedLimiter;
use crate::models::{JobDescriptor, JobRecord, JobStatus};
use crate::queue::JobQueue;
use crate::saver::FileSaver;
use crate::state_manager::{StateError, StateManager};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("job with ID {0} already exists")]
    DuplicateJob(String),
}

/// Resolves once the spawned transfer task has fully settled.
type TransferDone = Shared<BoxFuture<'static, ()>>;

/// The one transfer currently allowed to run.
struct ActiveTransfer {
    job_id: String,
    token: CancellationToken,
    done: TransferDone,
}

struct Inner {
    jobs: JobQueue,
    active: Option<ActiveTransfer>,
}

impl Inner {
    /// Cancels the active transfer if it belongs to `job_id` and hands back a
    /// future to wait for it.
    fn abort_if_active(&self, job_id: &str) -> Option<TransferDone> {
        let active = self.active.as_ref().filter(|active| active.job_id == job_id)?;
        active.token.cancel();
        Some(active.done.clone())
    }
}

/// The download queue: owns every job and all of their state transitions.
///
/// At most one job transfers at a time. Queued jobs are started in list
/// order by `process_queue`, which `run` calls whenever something changes
/// and, as a fallback, every `poll_interval`.
pub struct DownloadManager {
    state_manager: StateManager,
    worker: DownloadWorker,
    inner: Mutex<Inner>,
    updates: watch::Sender<Vec<JobRecord>>,
    wake: Notify,
    poll_interval: Duration,
}

impl DownloadManager {
    /// Restores the job list from `state_manager` and prepares the worker.
    ///
    /// A job that was mid-transfer when the previous process stopped comes
    /// back as paused. Byte counters are recomputed from the persisted chunks.
    pub async fn new(
        state_manager: StateManager,
        config: ManagerConfig,
        auth: Arc<dyn TokenProvider>,
    ) -> Result<Self, ManagerError> {
        let mut loaded_jobs = Vec::new();
        for mut job in state_manager.load_all_jobs().await? {
            match job.status {
                JobStatus::Completed => {
                    loaded_jobs.push(job);
                    continue;
                }
                // A cancellation that never finished purging.
                JobStatus::Cancelled => {
                    state_manager.remove_chunks(&job.id).await?;
                    state_manager.delete_job(&job.id).await?;
                    continue;
                }
                _ => {}
            }

            let received = state_manager.chunk_bytes(&job.id).await?;
            let mut changed = received != job.received;
            if job.status == JobStatus::InProgress {
                job.status = JobStatus::Paused;
                changed = true;
            }
            if changed {
                job.set_counters(received, job.total);
                state_manager.save_job(&job).await?;
            }
            loaded_jobs.push(job);
        }
        info!(jobs = loaded_jobs.len(), "restored download queue");

        let http_client = Client::builder().user_agent(config.user_agent.clone()).build()?;
        let worker = DownloadWorker::new(
            http_client,
            state_manager.clone(),
            FileSaver::new(config.download_dir.clone()),
            SpeedLimiter::new(config.speed_limit),
            auth,
        )
        .verify_checksums(config.verify_checksums);

        let jobs = JobQueue::from_records(loaded_jobs);
        let (updates, _) = watch::channel(jobs.snapshot());

        Ok(Self {
            state_manager,
            worker,
            inner: Mutex::new(Inner { jobs, active: None }),
            updates,
            wake: Notify::new(),
            poll_interval: config.poll_interval(),
        })
    }

    /// Drives the queue forever. Spawn it once per manager; stop it by
    /// aborting the task.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.process_queue().await {
                warn!(error = %e, "queue processing failed");
            }
            tokio::select! {
                _ = self.wake.notified() => {},
                _ = tokio::time::sleep(self.poll_interval) => {},
            }
        }
    }

    /// Starts the first queued job, unless a transfer is already running.
    pub async fn process_queue(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        if inner.active.is_some() || inner.jobs.has_in_progress() {
            return Ok(());
        }
        let Some(job_id) = inner.jobs.first_queued().map(|job| job.id.clone()) else {
            return Ok(());
        };

        let chunks = match self.state_manager.get_chunks(&job_id).await {
            Ok(chunks) => chunks.unwrap_or_default(),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "could not load persisted chunks");
                if let Some(job) = inner.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                }
                self.persist(&inner, &job_id).await;
                self.publish(&inner);
                return Err(e.into());
            }
        };
        let received: u64 = chunks.iter().map(|chunk| chunk.len() as u64).sum();

        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(());
        };
        job.status = JobStatus::InProgress;
        job.error = None;
        job.set_counters(received, job.total);
        let request = TransferRequest {
            id: job.id.clone(),
            url: job.url.clone(),
            filename: job.filename.clone(),
            sha256: job.sha256.clone(),
            chunks,
            total: job.total,
        };
        info!(job_id = %job_id, offset = received, "starting transfer");
        self.persist(&inner, &job_id).await;
        self.publish(&inner);

        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move { this.execute(request, task_token).await });
        inner.active = Some(ActiveTransfer {
            job_id,
            token,
            done: handle.map(|_| ()).boxed().shared(),
        });
        Ok(())
    }

    async fn execute(self: Arc<Self>, request: TransferRequest, token: CancellationToken) {
        let job_id = request.id.clone();
        let sink = JobProgress {
            manager: self.as_ref(),
            job_id: job_id.clone(),
        };
        let outcome = self.worker.run(request, &token, &sink).await;
        self.settle(&job_id, outcome).await;
    }

    /// Applies the outcome of a finished transfer and frees the active slot.
    async fn settle(&self, job_id: &str, outcome: TransferOutcome) {
        let mut inner = self.inner.lock().await;
        if inner.active.as_ref().is_some_and(|active| active.job_id == job_id) {
            inner.active = None;
        }

        if let Some(job) = inner.jobs.get_mut(job_id) {
            // Only an in-progress job can settle; cancelled ones are purged by
            // whoever cancelled them.
            if job.status == JobStatus::InProgress {
                match outcome {
                    TransferOutcome::Completed { .. } => {
                        let total = job.total.max(job.received);
                        job.set_counters(job.received, total);
                        job.progress = 100;
                        job.status = JobStatus::Completed;
                        info!(job_id = %job_id, bytes = job.received, "download completed");
                    }
                    TransferOutcome::Aborted => {
                        job.status = JobStatus::Paused;
                        info!(job_id = %job_id, bytes = job.received, "download paused");
                    }
                    TransferOutcome::Failed(e) => {
                        job.status = JobStatus::Failed;
                        job.error = Some(e.to_string());
                        warn!(job_id = %job_id, error = %e, "download failed");
                    }
                }
                self.persist(&inner, job_id).await;
                self.publish(&inner);
            }
        }
        drop(inner);
        self.wake.notify_one();
    }

    /// Enqueues a new job. Its id must not be in use.
    pub async fn start_download(&self, descriptor: JobDescriptor) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.get(&descriptor.id).is_some() {
            return Err(ManagerError::DuplicateJob(descriptor.id));
        }
        let record = JobRecord::new(descriptor);
        self.state_manager.save_job(&record).await?;
        info!(job_id = %record.id, url = %record.url, "job queued");
        inner.jobs.push(record);
        self.publish(&inner);
        drop(inner);

        self.wake.notify_one();
        Ok(())
    }

    /// Stops the job's transfer and keeps what it received. No-op unless the
    /// job is in progress.
    pub async fn pause_download(&self, job_id: &str) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        let is_active = match inner.jobs.get(job_id) {
            Some(job) if job.status == JobStatus::InProgress => {
                inner.active.as_ref().is_some_and(|active| active.job_id == job_id)
            }
            _ => {
                debug!(job_id = %job_id, "pause ignored");
                return Ok(());
            }
        };

        if !is_active {
            // No transfer behind it; nothing to wait for.
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.status = JobStatus::Paused;
                self.state_manager.save_job(job).await?;
            }
            self.publish(&inner);
            return Ok(());
        }

        let done = inner.abort_if_active(job_id);
        drop(inner);
        if let Some(done) = done {
            done.await;
        }
        Ok(())
    }

    /// Re-queues a paused job behind the jobs that were queued before it.
    pub async fn resume_download(&self, job_id: &str) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.get(job_id).map(|job| job.status) != Some(JobStatus::Paused) {
            debug!(job_id = %job_id, "resume ignored");
            return Ok(());
        }

        let received = self.state_manager.chunk_bytes(job_id).await?;
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.status = JobStatus::Queued;
            job.error = None;
            job.set_counters(received, job.total);
            self.state_manager.save_job(job).await?;
        }
        info!(job_id = %job_id, offset = received, "job resumed");
        self.publish(&inner);
        drop(inner);

        self.wake.notify_one();
        Ok(())
    }

    /// Removes the job and its persisted chunks, whatever its status. An
    /// in-flight transfer is aborted and awaited first.
    pub async fn cancel_download(&self, job_id: &str) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        let done = match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.status = JobStatus::Cancelled;
                self.persist(&inner, job_id).await;
                self.publish(&inner);
                inner.abort_if_active(job_id)
            }
            None => None,
        };
        drop(inner);

        if let Some(done) = done {
            done.await;
        }

        let mut inner = self.inner.lock().await;
        self.state_manager.remove_chunks(job_id).await?;
        self.state_manager.delete_job(job_id).await?;
        if inner.jobs.remove(job_id).is_some() {
            info!(job_id = %job_id, "job cancelled");
        }
        self.publish(&inner);
        drop(inner);

        self.wake.notify_one();
        Ok(())
    }

    /// Drops completed jobs from the list. Their chunks are already gone.
    pub async fn clear_completed(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.jobs.remove_with_status(JobStatus::Completed);
        for job_id in &removed {
            self.state_manager.delete_job(job_id).await?;
        }
        debug!(count = removed.len(), "cleared completed jobs");
        self.publish(&inner);
        Ok(())
    }

    /// Aborts the running transfer, then drops every job and every chunk.
    pub async fn clear_all(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        // Nothing may be promoted while the active transfer winds down.
        for job in inner.jobs.iter_mut() {
            job.status = JobStatus::Cancelled;
        }
        self.publish(&inner);
        let done = inner
            .active
            .as_ref()
            .map(|active| active.job_id.clone())
            .and_then(|job_id| inner.abort_if_active(&job_id));
        drop(inner);

        if let Some(done) = done {
            done.await;
        }

        let mut inner = self.inner.lock().await;
        self.state_manager.clear().await?;
        let removed = inner.jobs.drain_ids();
        info!(count = removed.len(), "cleared all jobs");
        self.publish(&inner);
        Ok(())
    }

    /// Sets the shared byte rate for transfers; 0 disables limiting.
    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.worker.limiter().set_rate(bytes_per_sec).await;
    }

    /// The job list in queueing order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.updates.borrow().clone()
    }

    pub fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.updates.borrow().iter().find(|job| job.id == job_id).cloned()
    }

    /// Receives a fresh snapshot of the job list after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<JobRecord>> {
        self.updates.subscribe()
    }

    /// Waits until no job is queued or in progress.
    pub async fn wait_until_idle(&self) {
        let mut updates = self.subscribe();
        let _ = updates
            .wait_for(|jobs| {
                jobs.iter()
                    .all(|job| !matches!(job.status, JobStatus::Queued | JobStatus::InProgress))
            })
            .await;
    }

    async fn persist(&self, inner: &MutexGuard<'_, Inner>, job_id: &str) {
        let Some(job) = inner.jobs.get(job_id) else {
            return;
        };
        if let Err(e) = self.state_manager.save_job(job).await {
            warn!(job_id = %job_id, error = %e, "could not persist job");
        }
    }

    fn publish(&self, inner: &MutexGuard<'_, Inner>) {
        self.updates.send_replace(inner.jobs.snapshot());
    }
}

/// Feeds transfer progress of one job back into the manager.
struct JobProgress<'a> {
    manager: &'a DownloadManager,
    job_id: String,
}

impl ProgressSink for JobProgress<'_> {
    fn report(&self, received: u64, total: u64) -> impl Future<Output = ()> + Send {
        async move {
            let mut inner = self.manager.inner.lock().await;
            if let Some(job) = inner.jobs.get_mut(&self.job_id) {
                if job.status == JobStatus::InProgress {
                    job.set_counters(received, total);
                }
            }
            self.manager.publish(&inner);
        }
    }
}
