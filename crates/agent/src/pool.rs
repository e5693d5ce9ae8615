//! Bounded worker pool delivering batches through a shared [`Transport`].
//!
//! Jobs flow through a bounded queue; a full queue makes the producer wait.
//! Every accepted job yields exactly one [`JobResult`], including jobs still
//! queued when the pool is shut down.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use metric_types::Batch;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::retry::retry_action;
use utils::retry::RetryError;
use utils::retry::DEFAULT_DELAYS;

use crate::transport::Transport;
use crate::transport::TransportError;

#[derive(Debug)]
pub struct Job {
    pub batch: Batch,
}

#[derive(Debug)]
pub struct JobResult {
    pub id: u64,
    pub error: Option<Report<TransportError>>,
}

impl JobResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry_delays: Vec<Duration>,
}

impl PoolConfig {
    /// `rate_limit` workers with a queue twice that deep.
    pub fn new(rate_limit: usize) -> Self {
        let workers = rate_limit.max(1);
        Self {
            workers,
            queue_capacity: workers * 2,
            retry_delays: DEFAULT_DELAYS.to_vec(),
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    queue: SharedReceiver,
    results: mpsc::Sender<JobResult>,
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl WorkerPool {
    /// Spawn the workers; the receiver yields one result per accepted job and
    /// closes once the pool has shut down.
    pub fn new(
        config: PoolConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Receiver<JobResult>) {
        let capacity = config.queue_capacity.max(1);
        let (jobs, queue) = mpsc::channel(capacity);
        let (results, results_rx) = mpsc::channel(capacity);
        let queue = Arc::new(Mutex::new(queue));
        let token = CancellationToken::new();
        let delays: Arc<[Duration]> = config.retry_delays.into();

        let workers = (0..config.workers.max(1))
            .map(|index| {
                tokio::spawn(worker(
                    index,
                    queue.clone(),
                    transport.clone(),
                    results.clone(),
                    delays.clone(),
                    token.clone(),
                ))
            })
            .collect();
        info!(workers = config.workers.max(1), capacity, "worker pool started");

        (
            Self {
                jobs,
                queue,
                results,
                workers,
                token,
            },
            results_rx,
        )
    }

    /// Queue `job`, waiting while the queue is full.
    ///
    /// The job is handed back when the pool is shutting down.
    pub async fn submit(&self, job: Job) -> Result<(), Job> {
        if self.token.is_cancelled() {
            return Err(job);
        }
        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(job),
            permit = self.jobs.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(job);
                Ok(())
            }
            Err(_) => Err(job),
        }
    }

    /// Stop accepting jobs, let the workers drain the queue for up to
    /// `grace`, then cancel them and report whatever is left as cancelled.
    pub async fn shutdown(self, grace: Duration) {
        let Self {
            jobs,
            queue,
            results,
            mut workers,
            token,
        } = self;
        drop(jobs);

        let drained = tokio::time::timeout(grace, async {
            while let Some(worker) = workers.last_mut() {
                if let Err(e) = worker.await {
                    warn!("worker failed during shutdown: {e}");
                }
                workers.pop();
            }
        })
        .await;

        if drained.is_err() {
            warn!(?grace, "worker pool did not drain in time, cancelling");
            token.cancel();
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!("worker failed during shutdown: {e}");
                }
            }
        }
        token.cancel();

        let mut queue = queue.lock().await;
        let mut cancelled = 0;
        while let Ok(job) = queue.try_recv() {
            cancelled += 1;
            let result = JobResult {
                id: job.batch.id,
                error: Some(Report::new(TransportError::Cancelled)),
            };
            if results.send(result).await.is_err() {
                break;
            }
        }
        queue.close();
        info!(cancelled, "worker pool stopped");
    }
}

async fn worker(
    index: usize,
    queue: SharedReceiver,
    transport: Arc<dyn Transport>,
    results: mpsc::Sender<JobResult>,
    delays: Arc<[Duration]>,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            job = async { queue.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        let id = job.batch.id;
        let delivery = retry_action(
            &token,
            &delays,
            || transport.send(&job.batch),
            &[TransportError::is_retryable_report],
        );
        // an in-flight send is abandoned once the pool is cancelled
        let outcome = tokio::select! {
            outcome = delivery => outcome,
            _ = token.cancelled() => Err(RetryError::Cancelled),
        };
        let error = match outcome {
            Ok(()) => None,
            Err(RetryError::Cancelled) => Some(Report::new(TransportError::Cancelled)),
            Err(RetryError::Failed(report)) => Some(report),
        };
        match &error {
            None => debug!(worker = index, batch = id, "batch delivered"),
            Some(e) => warn!(worker = index, batch = id, "batch delivery failed: {e:?}"),
        }

        if results.send(JobResult { id, error }).await.is_err() {
            break;
        }
    }
    debug!(worker = index, "worker stopped");
}
