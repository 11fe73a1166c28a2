use super::backoff::{retry_with_backoff, RetryDisposition, RetryPolicy};
use super::{IndexJob, JobHandler, JobQueue};
use crate::bus::catch_task_panic;
use crate::error::{find_indexer_error, IndexerError, IndexerResult};
use crate::runtime::telemetry::Telemetry;
use anyhow::bail;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A job that exhausted its attempts or was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    pub job: IndexJob,
    pub attempts: usize,
    pub error: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub pending: usize,
}

struct QueueShared {
    sender: mpsc::UnboundedSender<IndexJob>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<IndexJob>>,
    policy: RetryPolicy,
    workers: usize,
    shutdown: CancellationToken,
    processing: AtomicBool,
    pending: AtomicUsize,
    idle: Notify,
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    failed_jobs: Mutex<Vec<FailedJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    telemetry: Option<Arc<Telemetry>>,
}

/// Job queue backed by an unbounded channel drained by a fixed set of workers.
#[derive(Clone)]
pub struct MemoryJobQueue {
    shared: Arc<QueueShared>,
}

impl MemoryJobQueue {
    pub fn new(workers: usize, policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self::build(workers, policy, shutdown, None)
    }

    pub fn with_telemetry(
        workers: usize,
        policy: RetryPolicy,
        shutdown: CancellationToken,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self::build(workers, policy, shutdown, Some(telemetry))
    }

    fn build(
        workers: usize,
        policy: RetryPolicy,
        shutdown: CancellationToken,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(QueueShared {
                sender,
                receiver: AsyncMutex::new(receiver),
                policy,
                workers: workers.max(1),
                shutdown,
                processing: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                enqueued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                failed_jobs: Mutex::new(Vec::new()),
                handles: Mutex::new(Vec::new()),
                telemetry,
            }),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let shared = &self.shared;
        QueueStats {
            enqueued: shared.enqueued.load(Ordering::Relaxed),
            completed: shared.completed.load(Ordering::Relaxed),
            retried: shared.retried.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            pending: shared.pending.load(Ordering::SeqCst),
        }
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.shared.failed_jobs.lock().clone()
    }

    /// Resolves once every enqueued job has either completed or failed permanently.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancels the workers and waits for them to exit. Jobs still queued stay undelivered.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "queue worker join failed");
            }
        }
    }
}

impl JobQueue for MemoryJobQueue {
    fn add(&self, job: IndexJob) -> BoxFuture<'_, IndexerResult<()>> {
        Box::pin(async move {
            let shared = &self.shared;
            if shared.shutdown.is_cancelled() {
                return Err(IndexerError::queue("queue is shut down"));
            }
            shared.pending.fetch_add(1, Ordering::SeqCst);
            if shared.sender.send(job).is_err() {
                shared.finish_one();
                return Err(IndexerError::queue("queue channel closed"));
            }
            shared.enqueued.fetch_add(1, Ordering::Relaxed);
            if let Some(telemetry) = &shared.telemetry {
                telemetry.record_job_enqueued();
            }
            tracing::trace!(height = job.height, fork = job.fork, "job enqueued");
            Ok(())
        })
    }

    fn process(&self, handler: JobHandler) -> anyhow::Result<()> {
        if self.shared.processing.swap(true, Ordering::SeqCst) {
            bail!("queue is already processing");
        }

        let mut handles = self.shared.handles.lock();
        for worker_id in 0..self.shared.workers {
            let shared = Arc::clone(&self.shared);
            let handler = Arc::clone(&handler);
            handles.push(tokio::spawn(async move {
                shared.run_worker(worker_id, handler).await;
            }));
        }
        tracing::info!(workers = self.shared.workers, "job queue processing started");
        Ok(())
    }
}

impl QueueShared {
    async fn run_worker(&self, worker_id: usize, handler: JobHandler) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    job = receiver.recv() => job,
                }
            };
            let Some(job) = next else {
                tracing::debug!(worker = worker_id, "queue worker stopping");
                return;
            };

            self.execute(worker_id, job, &handler).await;
            self.finish_one();
        }
    }

    async fn execute(&self, worker_id: usize, job: IndexJob, handler: &JobHandler) {
        let mut attempts = 0;
        let result = retry_with_backoff(
            self.policy,
            &self.shutdown,
            |attempt| {
                attempts = attempt;
                catch_task_panic(handler(job))
            },
            classify_job_error,
            |attempt, delay, err, will_retry| {
                if will_retry {
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.record_job_retried();
                    }
                    tracing::warn!(
                        worker = worker_id,
                        height = job.height,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "job attempt failed; retrying"
                    );
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_job_completed();
                }
            }
            Err(err) if self.shutdown.is_cancelled() => {
                tracing::info!(
                    height = job.height,
                    error = %err,
                    "job abandoned during shutdown"
                );
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_job_failed();
                }
                tracing::error!(
                    worker = worker_id,
                    height = job.height,
                    fork = job.fork,
                    attempts,
                    error = %format!("{err:#}"),
                    "job failed permanently"
                );
                self.failed_jobs.lock().push(FailedJob {
                    job,
                    attempts,
                    error: format!("{err:#}"),
                });
            }
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn classify_job_error(err: &anyhow::Error) -> RetryDisposition {
    match find_indexer_error(err) {
        Some(typed) if !typed.is_transient() => RetryDisposition::Abort,
        _ => RetryDisposition::Retry,
    }
}
